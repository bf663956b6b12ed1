// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! HEVC bitstream preparation.
//!
//! VPS, SPS and PPS are reconstructed from the parsed picture parameters
//! and emitted ahead of the next IDR or CRA slice. Parameter-set NAL units
//! arriving in-band through the slice data are dropped: the decoder must
//! see exactly one, consistent set, and it is ours.
//!
//! Both synthesised ordering fields (`*_max_num_reorder_pics`) are zero.
//! A stateful decoder told it may reorder will buffer frames internally,
//! which deadlocks the synchronous one-picture-in, one-frame-out model
//! used here; consumers reorder on their own using the picture order count.

use crate::bitstream::BitWriter;
use crate::bitstream::Bitstream;
use crate::codec::slice_payload;
use crate::codec::SliceParameter;

/// HEVC nal_unit_type values.
const NAL_IDR_W_RADL: u8 = 19;
const NAL_CRA_NUT: u8 = 21;
const NAL_VPS: u8 = 32;
const NAL_SPS: u8 = 33;
const NAL_PPS: u8 = 34;

const HEADER_CAPACITY: usize = 256;

/// ITU-T H.273 colour description codes.
const COLOR_PRIMARIES_BT709: u32 = 1;
const COLOR_PRIMARIES_BT2020: u32 = 9;
const TRANSFER_BT709: u32 = 1;
const TRANSFER_PQ: u32 = 16;
const MATRIX_BT709: u32 = 1;
const MATRIX_BT2020_NCL: u32 = 9;

/// Picture-level flags from the parsed parameters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PicFields {
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub scaling_list_enabled_flag: bool,
    pub amp_enabled_flag: bool,
    pub pcm_enabled_flag: bool,
    pub pcm_loop_filter_disabled_flag: bool,
    pub strong_intra_smoothing_enabled_flag: bool,
    pub sign_data_hiding_enabled_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub transform_skip_enabled_flag: bool,
    pub cu_qp_delta_enabled_flag: bool,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_flag: bool,
    pub transquant_bypass_enabled_flag: bool,
    pub tiles_enabled_flag: bool,
    pub entropy_coding_sync_enabled_flag: bool,
    pub loop_filter_across_tiles_enabled_flag: bool,
    pub pps_loop_filter_across_slices_enabled_flag: bool,
}

/// Slice-parsing flags from the parsed parameters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceParsingFields {
    pub dependent_slice_segments_enabled_flag: bool,
    pub output_flag_present_flag: bool,
    pub cabac_init_present_flag: bool,
    pub pps_slice_chroma_qp_offsets_present_flag: bool,
    pub sample_adaptive_offset_enabled_flag: bool,
    pub long_term_ref_pics_present_flag: bool,
    pub sps_temporal_mvp_enabled_flag: bool,
    pub deblocking_filter_override_enabled_flag: bool,
    pub pps_disable_deblocking_filter_flag: bool,
    pub lists_modification_present_flag: bool,
    pub slice_segment_header_extension_present_flag: bool,
}

/// Parsed HEVC picture parameters, as delivered through the decode API.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureParameters {
    pub pic_width_in_luma_samples: u16,
    pub pic_height_in_luma_samples: u16,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub sps_max_dec_pic_buffering_minus1: u8,
    pub log2_min_luma_coding_block_size_minus3: u8,
    pub log2_diff_max_min_luma_coding_block_size: u8,
    pub log2_min_transform_block_size_minus2: u8,
    pub log2_diff_max_min_transform_block_size: u8,
    pub max_transform_hierarchy_depth_inter: u8,
    pub max_transform_hierarchy_depth_intra: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub pcm_sample_bit_depth_luma_minus1: u8,
    pub pcm_sample_bit_depth_chroma_minus1: u8,
    pub log2_min_pcm_luma_coding_block_size_minus3: u8,
    pub log2_diff_max_min_pcm_luma_coding_block_size: u8,
    pub init_qp_minus26: i8,
    pub diff_cu_qp_delta_depth: u8,
    pub pps_cb_qp_offset: i8,
    pub pps_cr_qp_offset: i8,
    pub pps_beta_offset_div2: i8,
    pub pps_tc_offset_div2: i8,
    pub log2_parallel_merge_level_minus2: u8,
    pub num_extra_slice_header_bits: u8,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub num_tile_columns_minus1: u8,
    pub num_tile_rows_minus1: u8,
    pub pic_fields: PicFields,
    pub slice_parsing_fields: SliceParsingFields,
}

/// general_profile_idc: Main-10 when the stream exceeds 8-bit, Main
/// otherwise.
pub fn profile_idc(pic: &PictureParameters) -> u32 {
    if pic.bit_depth_luma_minus8 > 0 {
        2
    } else {
        1
    }
}

// ITU-T H.265 Table A.6 luma-sample limits, scanned in order; the first row
// that fits wins.
const LEVEL_LIMITS: [(u32, u32); 12] = [
    (36_864, 30),
    (122_880, 60),
    (245_760, 63),
    (552_960, 90),
    (983_040, 93),
    (2_228_224, 120),
    (2_228_224, 123),
    (8_912_896, 150),
    (8_912_896, 153),
    (8_912_896, 156),
    (35_651_584, 180),
    (35_651_584, 183),
];

/// general_level_idc (level number times 30).
pub fn level_idc(pic: &PictureParameters) -> u32 {
    let pixels = pic.pic_width_in_luma_samples as u32 * pic.pic_height_in_luma_samples as u32;
    LEVEL_LIMITS
        .iter()
        .find(|&&(limit, _)| pixels <= limit)
        .map(|&(_, level)| level)
        .unwrap_or(186)
}

/// general_tier_flag: High tier for 4K-class content at level 5.0 and up,
/// which needs the higher bitrate ceilings; Main tier otherwise.
pub fn tier_flag(pic: &PictureParameters, level_idc: u32) -> u32 {
    let pixels = pic.pic_width_in_luma_samples as u32 * pic.pic_height_in_luma_samples as u32;
    u32::from(level_idc >= 150 && pixels >= 8_294_400)
}

/// Two-byte HEVC NAL unit header: forbidden_zero_bit, nal_unit_type,
/// nuh_layer_id = 0, nuh_temporal_id_plus1 = 1.
fn write_nal_header(bw: &mut BitWriter, nal_type: u8) {
    bw.put_bits(0, 1);
    bw.put_bits(nal_type as u32, 6);
    bw.put_bits(0, 6);
    bw.put_bits(1, 3);
}

/// general profile_tier_level(), shared between VPS and SPS.
fn write_profile_tier_level(bw: &mut BitWriter, pic: &PictureParameters) {
    let level_idc = level_idc(pic);
    let profile_idc = profile_idc(pic);

    bw.put_bits(0, 2); // general_profile_space
    bw.put_bits(tier_flag(pic, level_idc), 1);
    bw.put_bits(profile_idc, 5);

    // general_profile_compatibility_flag[32], flag[j] at bit 31 - j.
    // Main is decodable by Main and Main-10 decoders, so it sets both flags;
    // Main-10 only sets its own.
    let compat: u32 = if profile_idc == 2 { 1 << 29 } else { (1 << 30) | (1 << 29) };
    bw.put_bits(compat, 32);

    bw.put_bits(1, 1); // general_progressive_source_flag
    bw.put_bits(0, 1); // general_interlaced_source_flag
    bw.put_bits(0, 1); // general_non_packed_constraint_flag
    bw.put_bits(1, 1); // general_frame_only_constraint_flag
    bw.put_bits(0, 32); // general_reserved_zero_44bits
    bw.put_bits(0, 12);
    bw.put_bits(level_idc, 8);
}

/// VUI parameters carrying the colour description: BT.2020 with the PQ
/// transfer for 10-bit streams, BT.709 for 8-bit.
fn write_vui(bw: &mut BitWriter, pic: &PictureParameters) {
    let is_hdr = pic.bit_depth_luma_minus8 > 0;

    bw.put_bits(0, 1); // aspect_ratio_info_present_flag
    bw.put_bits(0, 1); // overscan_info_present_flag

    bw.put_bits(1, 1); // video_signal_type_present_flag
    bw.put_bits(5, 3); // video_format: unspecified
    bw.put_bits(0, 1); // video_full_range_flag
    bw.put_bits(1, 1); // colour_description_present_flag
    if is_hdr {
        bw.put_bits(COLOR_PRIMARIES_BT2020, 8);
        bw.put_bits(TRANSFER_PQ, 8);
        bw.put_bits(MATRIX_BT2020_NCL, 8);
    } else {
        bw.put_bits(COLOR_PRIMARIES_BT709, 8);
        bw.put_bits(TRANSFER_BT709, 8);
        bw.put_bits(MATRIX_BT709, 8);
    }

    bw.put_bits(0, 1); // chroma_loc_info_present_flag
    bw.put_bits(0, 1); // neutral_chroma_indication_flag
    bw.put_bits(0, 1); // field_seq_flag
    bw.put_bits(0, 1); // frame_field_info_present_flag
    bw.put_bits(0, 1); // default_display_window_flag
    bw.put_bits(0, 1); // vui_timing_info_present_flag
    bw.put_bits(0, 1); // bitstream_restriction_flag
}

fn generate_vps(pic: &PictureParameters) -> Vec<u8> {
    let mut bw = BitWriter::with_capacity(HEADER_CAPACITY);

    write_nal_header(&mut bw, NAL_VPS);

    bw.put_bits(0, 4); // vps_video_parameter_set_id
    bw.put_bits(1, 1); // vps_base_layer_internal_flag
    bw.put_bits(1, 1); // vps_base_layer_available_flag
    bw.put_bits(0, 6); // vps_max_layers_minus1
    bw.put_bits(0, 3); // vps_max_sub_layers_minus1
    bw.put_bits(1, 1); // vps_temporal_id_nesting_flag
    bw.put_bits(0xffff, 16); // vps_reserved_0xffff_16bits

    write_profile_tier_level(&mut bw, pic);

    bw.put_bits(1, 1); // vps_sub_layer_ordering_info_present_flag
    bw.put_ue(pic.sps_max_dec_pic_buffering_minus1 as u32);
    bw.put_ue(0); // vps_max_num_reorder_pics
    bw.put_ue(0); // vps_max_latency_increase_plus1

    bw.put_bits(0, 6); // vps_max_layer_id
    bw.put_ue(0); // vps_num_layer_sets_minus1
    bw.put_bits(0, 1); // vps_timing_info_present_flag
    bw.put_bits(0, 1); // vps_extension_flag

    bw.finish()
}

fn generate_sps(pic: &PictureParameters) -> Vec<u8> {
    let mut bw = BitWriter::with_capacity(HEADER_CAPACITY);

    write_nal_header(&mut bw, NAL_SPS);

    bw.put_bits(0, 4); // sps_video_parameter_set_id
    bw.put_bits(0, 3); // sps_max_sub_layers_minus1
    bw.put_bits(1, 1); // sps_temporal_id_nesting_flag

    write_profile_tier_level(&mut bw, pic);

    bw.put_ue(0); // sps_seq_parameter_set_id
    bw.put_ue(pic.pic_fields.chroma_format_idc as u32);
    if pic.pic_fields.chroma_format_idc == 3 {
        bw.put_bits(u32::from(pic.pic_fields.separate_colour_plane_flag), 1);
    }

    let width = pic.pic_width_in_luma_samples as u32;
    let height = pic.pic_height_in_luma_samples as u32;
    bw.put_ue(width);
    bw.put_ue(height);

    // Conformance window: needed whenever the coding-tree-block grid does
    // not divide the picture exactly.
    let ctb_size = 1u32
        << (pic.log2_min_luma_coding_block_size_minus3 as u32
            + 3
            + pic.log2_diff_max_min_luma_coding_block_size as u32);
    let aligned_width = width.div_ceil(ctb_size) * ctb_size;
    let aligned_height = height.div_ceil(ctb_size) * ctb_size;
    if aligned_width != width || aligned_height != height {
        let sub_width_c: u32 = match pic.pic_fields.chroma_format_idc {
            1 | 2 => 2,
            _ => 1,
        };
        let sub_height_c: u32 = if pic.pic_fields.chroma_format_idc == 1 { 2 } else { 1 };
        bw.put_bits(1, 1); // conformance_window_flag
        bw.put_ue(0); // conf_win_left_offset
        bw.put_ue((aligned_width - width) / sub_width_c);
        bw.put_ue(0); // conf_win_top_offset
        bw.put_ue((aligned_height - height) / sub_height_c);
    } else {
        bw.put_bits(0, 1);
    }

    bw.put_ue(pic.bit_depth_luma_minus8 as u32);
    bw.put_ue(pic.bit_depth_chroma_minus8 as u32);
    bw.put_ue(pic.log2_max_pic_order_cnt_lsb_minus4 as u32);

    bw.put_bits(1, 1); // sps_sub_layer_ordering_info_present_flag
    bw.put_ue(pic.sps_max_dec_pic_buffering_minus1 as u32);
    bw.put_ue(0); // sps_max_num_reorder_pics
    bw.put_ue(0); // sps_max_latency_increase_plus1

    bw.put_ue(pic.log2_min_luma_coding_block_size_minus3 as u32);
    bw.put_ue(pic.log2_diff_max_min_luma_coding_block_size as u32);
    bw.put_ue(pic.log2_min_transform_block_size_minus2 as u32);
    bw.put_ue(pic.log2_diff_max_min_transform_block_size as u32);
    bw.put_ue(pic.max_transform_hierarchy_depth_inter as u32);
    bw.put_ue(pic.max_transform_hierarchy_depth_intra as u32);

    bw.put_bits(u32::from(pic.pic_fields.scaling_list_enabled_flag), 1);
    if pic.pic_fields.scaling_list_enabled_flag {
        bw.put_bits(0, 1); // sps_scaling_list_data_present_flag
    }

    bw.put_bits(u32::from(pic.pic_fields.amp_enabled_flag), 1);
    bw.put_bits(u32::from(pic.slice_parsing_fields.sample_adaptive_offset_enabled_flag), 1);

    bw.put_bits(u32::from(pic.pic_fields.pcm_enabled_flag), 1);
    if pic.pic_fields.pcm_enabled_flag {
        bw.put_bits(pic.pcm_sample_bit_depth_luma_minus1 as u32, 4);
        bw.put_bits(pic.pcm_sample_bit_depth_chroma_minus1 as u32, 4);
        bw.put_ue(pic.log2_min_pcm_luma_coding_block_size_minus3 as u32);
        bw.put_ue(pic.log2_diff_max_min_pcm_luma_coding_block_size as u32);
        bw.put_bits(u32::from(pic.pic_fields.pcm_loop_filter_disabled_flag), 1);
    }

    bw.put_ue(0); // num_short_term_ref_pic_sets
    bw.put_bits(u32::from(pic.slice_parsing_fields.long_term_ref_pics_present_flag), 1);
    if pic.slice_parsing_fields.long_term_ref_pics_present_flag {
        bw.put_ue(0); // num_long_term_ref_pics_sps
    }

    bw.put_bits(u32::from(pic.slice_parsing_fields.sps_temporal_mvp_enabled_flag), 1);
    bw.put_bits(u32::from(pic.pic_fields.strong_intra_smoothing_enabled_flag), 1);

    bw.put_bits(1, 1); // vui_parameters_present_flag
    write_vui(&mut bw, pic);

    bw.put_bits(0, 1); // sps_extension_present_flag

    bw.finish()
}

fn generate_pps(pic: &PictureParameters) -> Vec<u8> {
    let mut bw = BitWriter::with_capacity(HEADER_CAPACITY);

    write_nal_header(&mut bw, NAL_PPS);

    bw.put_ue(0); // pps_pic_parameter_set_id
    bw.put_ue(0); // pps_seq_parameter_set_id

    bw.put_bits(u32::from(pic.slice_parsing_fields.dependent_slice_segments_enabled_flag), 1);
    bw.put_bits(u32::from(pic.slice_parsing_fields.output_flag_present_flag), 1);
    bw.put_bits(pic.num_extra_slice_header_bits as u32, 3);
    bw.put_bits(u32::from(pic.pic_fields.sign_data_hiding_enabled_flag), 1);
    bw.put_bits(u32::from(pic.slice_parsing_fields.cabac_init_present_flag), 1);

    bw.put_ue(pic.num_ref_idx_l0_default_active_minus1 as u32);
    bw.put_ue(pic.num_ref_idx_l1_default_active_minus1 as u32);

    bw.put_se(pic.init_qp_minus26 as i32);
    bw.put_bits(u32::from(pic.pic_fields.constrained_intra_pred_flag), 1);
    bw.put_bits(u32::from(pic.pic_fields.transform_skip_enabled_flag), 1);

    bw.put_bits(u32::from(pic.pic_fields.cu_qp_delta_enabled_flag), 1);
    if pic.pic_fields.cu_qp_delta_enabled_flag {
        bw.put_ue(pic.diff_cu_qp_delta_depth as u32);
    }

    bw.put_se(pic.pps_cb_qp_offset as i32);
    bw.put_se(pic.pps_cr_qp_offset as i32);
    bw.put_bits(u32::from(pic.slice_parsing_fields.pps_slice_chroma_qp_offsets_present_flag), 1);

    bw.put_bits(u32::from(pic.pic_fields.weighted_pred_flag), 1);
    bw.put_bits(u32::from(pic.pic_fields.weighted_bipred_flag), 1);
    bw.put_bits(u32::from(pic.pic_fields.transquant_bypass_enabled_flag), 1);

    bw.put_bits(u32::from(pic.pic_fields.tiles_enabled_flag), 1);
    bw.put_bits(u32::from(pic.pic_fields.entropy_coding_sync_enabled_flag), 1);
    if pic.pic_fields.tiles_enabled_flag {
        bw.put_ue(pic.num_tile_columns_minus1 as u32);
        bw.put_ue(pic.num_tile_rows_minus1 as u32);
        bw.put_bits(1, 1); // uniform_spacing_flag
        bw.put_bits(u32::from(pic.pic_fields.loop_filter_across_tiles_enabled_flag), 1);
    }

    bw.put_bits(u32::from(pic.pic_fields.pps_loop_filter_across_slices_enabled_flag), 1);

    let deblocking_present = pic.slice_parsing_fields.deblocking_filter_override_enabled_flag
        || pic.slice_parsing_fields.pps_disable_deblocking_filter_flag;
    bw.put_bits(u32::from(deblocking_present), 1);
    if deblocking_present {
        bw.put_bits(
            u32::from(pic.slice_parsing_fields.deblocking_filter_override_enabled_flag),
            1,
        );
        bw.put_bits(u32::from(pic.slice_parsing_fields.pps_disable_deblocking_filter_flag), 1);
        if !pic.slice_parsing_fields.pps_disable_deblocking_filter_flag {
            bw.put_se(pic.pps_beta_offset_div2 as i32);
            bw.put_se(pic.pps_tc_offset_div2 as i32);
        }
    }

    bw.put_bits(0, 1); // pps_scaling_list_data_present_flag
    bw.put_bits(u32::from(pic.slice_parsing_fields.lists_modification_present_flag), 1);
    bw.put_ue(pic.log2_parallel_merge_level_minus2 as u32);
    bw.put_bits(
        u32::from(pic.slice_parsing_fields.slice_segment_header_extension_present_flag),
        1,
    );
    bw.put_bits(0, 1); // pps_extension_present_flag

    bw.finish()
}

/// Per-session HEVC header state, keyed on the stream geometry so headers
/// are only regenerated when it changes.
#[derive(Default)]
pub struct HevcState {
    vps: Vec<u8>,
    sps: Vec<u8>,
    pps: Vec<u8>,
    params_sent: bool,
    cache_key: Option<(u16, u16, u8)>,
}

impl HevcState {
    pub(crate) fn update(&mut self, pic: &PictureParameters) {
        let key = (
            pic.pic_width_in_luma_samples,
            pic.pic_height_in_luma_samples,
            pic.bit_depth_luma_minus8,
        );
        if self.cache_key == Some(key) && !self.vps.is_empty() {
            return;
        }

        self.vps = generate_vps(pic);
        self.sps = generate_sps(pic);
        self.pps = generate_pps(pic);
        self.params_sent = false;
        self.cache_key = Some(key);

        let level = level_idc(pic);
        log::debug!(
            "HEVC: new headers for {}x{}, Main{}, level {}.{}, {} tier",
            pic.pic_width_in_luma_samples,
            pic.pic_height_in_luma_samples,
            if profile_idc(pic) == 2 { "10" } else { "" },
            level / 30,
            (level % 30) / 3,
            if tier_flag(pic, level) == 1 { "High" } else { "Main" }
        );
    }

    pub(crate) fn assemble(
        &mut self,
        bitstream: &mut Bitstream,
        slices: &[SliceParameter],
        data: &[u8],
    ) {
        for param in slices {
            let Some(payload) = slice_payload(data, param) else {
                log::warn!("HEVC: slice parameters out of range, dropped");
                continue;
            };
            let Some(&first) = payload.first() else {
                continue;
            };
            let nal_type = (first >> 1) & 0x3f;

            // In-band parameter sets are replaced by the synthesised ones.
            if (NAL_VPS..=NAL_PPS).contains(&nal_type) {
                continue;
            }

            if (NAL_IDR_W_RADL..=NAL_CRA_NUT).contains(&nal_type) && !self.params_sent {
                if !self.vps.is_empty() {
                    bitstream.append_nal(&self.vps);
                }
                if !self.sps.is_empty() {
                    bitstream.append_nal(&self.sps);
                }
                if !self.pps.is_empty() {
                    bitstream.append_nal(&self.pps);
                }
                self.params_sent = true;
            }

            bitstream.append_nal(payload);
        }
    }
}
