// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 bitstream preparation.
//!
//! The consumer delivers parsed sequence/picture state instead of the SPS
//! and PPS NAL units a stateful decoder needs, so both are reconstructed
//! here from the picture parameters and emitted ahead of the next IDR
//! slice.

use crate::bitstream::BitWriter;
use crate::bitstream::Bitstream;
use crate::codec::slice_payload;
use crate::codec::SliceParameter;

/// nal_unit_type of an IDR slice.
const NAL_SLICE_IDR: u8 = 5;

/// NAL header bytes: nal_ref_idc = 3 with nal_unit_type 7 (SPS) / 8 (PPS).
const NAL_HEADER_SPS: u32 = 0x67;
const NAL_HEADER_PPS: u32 = 0x68;

const HEADER_CAPACITY: usize = 128;

/// Sequence-level flags and fields carried inside the picture parameters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SeqFields {
    pub chroma_format_idc: u8,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: bool,
}

/// Picture-level flags and fields carried inside the picture parameters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PicFields {
    pub entropy_coding_mode_flag: bool,
    pub pic_order_present_flag: bool,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,
    pub transform_8x8_mode_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub deblocking_filter_control_present_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
}

/// Parsed H.264 picture parameters, as delivered through the decode API.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureParameters {
    pub picture_width_in_mbs_minus1: u16,
    pub picture_height_in_mbs_minus1: u16,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub num_ref_frames: u8,
    pub seq_fields: SeqFields,
    pub pic_fields: PicFields,
    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub second_chroma_qp_index_offset: i8,
}

/// Picks profile_idc from the decode features the parameters imply.
pub fn profile_idc(pic: &PictureParameters) -> u32 {
    if pic.bit_depth_luma_minus8 > 0 || pic.bit_depth_chroma_minus8 > 0 {
        return match pic.seq_fields.chroma_format_idc {
            3 => 244, // High 4:4:4 Predictive
            2 => 122, // High 4:2:2
            _ => 110, // High 10
        };
    }
    if pic.pic_fields.transform_8x8_mode_flag {
        100 // High
    } else if pic.pic_fields.entropy_coding_mode_flag {
        77 // Main
    } else {
        66 // Baseline
    }
}

// ITU-T H.264 Table A-1 limits on MaxDpbMbs, scanned in order; the first row
// that fits wins.
const LEVEL_LIMITS: [(u32, u32); 14] = [
    (396, 10),
    (900, 11),
    (2376, 12),
    (4752, 20),
    (8100, 21),
    (18000, 22),
    (20480, 30),
    (36864, 31),
    (32768, 32),
    (110400, 40),
    (184320, 41),
    (184320, 42),
    (696320, 50),
    (696320, 51),
];

/// Derives level_idc from the macroblock count and reference frame depth.
pub fn level_idc(pic: &PictureParameters) -> u32 {
    let width_mbs = pic.picture_width_in_mbs_minus1 as u32 + 1;
    let height_mbs = pic.picture_height_in_mbs_minus1 as u32 + 1;
    let max_dpb_mbs = width_mbs * height_mbs * (pic.num_ref_frames as u32 + 1);

    LEVEL_LIMITS
        .iter()
        .find(|&&(limit, _)| max_dpb_mbs <= limit)
        .map(|&(_, level)| level)
        .unwrap_or(52)
}

/// Bottom frame-cropping offset, in chroma units, for the coded sizes whose
/// macroblock-aligned height exceeds the intended display height.
fn crop_bottom(width_pixels: u32, height_pixels: u32) -> Option<u32> {
    match (width_pixels, height_pixels) {
        (1920, 1088) | (1280, 736) | (640, 368) => Some(4),
        _ => None,
    }
}

fn generate_sps(pic: &PictureParameters) -> Vec<u8> {
    let mut bw = BitWriter::with_capacity(HEADER_CAPACITY);

    let profile_idc = profile_idc(pic);
    let level_idc = level_idc(pic);

    let width_mbs = pic.picture_width_in_mbs_minus1 as u32 + 1;
    let height_mbs = pic.picture_height_in_mbs_minus1 as u32 + 1;
    let crop_bottom = crop_bottom(width_mbs * 16, height_mbs * 16);

    bw.put_bits(NAL_HEADER_SPS, 8);
    bw.put_bits(profile_idc, 8);

    // constraint_set0..5_flag, then reserved_zero_2bits.
    bw.put_bits(u32::from(profile_idc == 66), 1);
    bw.put_bits(u32::from(profile_idc <= 77), 1);
    bw.put_bits(0, 1);
    bw.put_bits(0, 1);
    bw.put_bits(0, 1);
    bw.put_bits(0, 1);
    bw.put_bits(0, 2);
    bw.put_bits(level_idc, 8);

    bw.put_ue(0); // seq_parameter_set_id

    if profile_idc >= 100 {
        bw.put_ue(pic.seq_fields.chroma_format_idc as u32);
        if pic.seq_fields.chroma_format_idc == 3 {
            bw.put_bits(0, 1); // separate_colour_plane_flag
        }
        bw.put_ue(pic.bit_depth_luma_minus8 as u32);
        bw.put_ue(pic.bit_depth_chroma_minus8 as u32);
        bw.put_bits(0, 1); // qpprime_y_zero_transform_bypass_flag
        bw.put_bits(0, 1); // seq_scaling_matrix_present_flag
    }

    bw.put_ue(pic.seq_fields.log2_max_frame_num_minus4 as u32);
    bw.put_ue(pic.seq_fields.pic_order_cnt_type as u32);
    match pic.seq_fields.pic_order_cnt_type {
        0 => bw.put_ue(pic.seq_fields.log2_max_pic_order_cnt_lsb_minus4 as u32),
        1 => {
            bw.put_bits(u32::from(pic.seq_fields.delta_pic_order_always_zero_flag), 1);
            bw.put_se(0); // offset_for_non_ref_pic
            bw.put_se(0); // offset_for_top_to_bottom_field
            bw.put_ue(0); // num_ref_frames_in_pic_order_cnt_cycle
        }
        _ => (),
    }

    bw.put_ue(pic.num_ref_frames as u32);
    bw.put_bits(u32::from(pic.seq_fields.gaps_in_frame_num_value_allowed_flag), 1);
    bw.put_ue(pic.picture_width_in_mbs_minus1 as u32);
    bw.put_ue(pic.picture_height_in_mbs_minus1 as u32);
    bw.put_bits(u32::from(pic.seq_fields.frame_mbs_only_flag), 1);
    if !pic.seq_fields.frame_mbs_only_flag {
        bw.put_bits(u32::from(pic.seq_fields.mb_adaptive_frame_field_flag), 1);
    }
    bw.put_bits(u32::from(pic.seq_fields.direct_8x8_inference_flag), 1);

    match crop_bottom {
        Some(bottom) => {
            bw.put_bits(1, 1); // frame_cropping_flag
            bw.put_ue(0); // frame_crop_left_offset
            bw.put_ue(0); // frame_crop_right_offset
            bw.put_ue(0); // frame_crop_top_offset
            bw.put_ue(bottom);
        }
        None => bw.put_bits(0, 1),
    }

    bw.put_bits(0, 1); // vui_parameters_present_flag

    bw.finish()
}

fn generate_pps(pic: &PictureParameters) -> Vec<u8> {
    let mut bw = BitWriter::with_capacity(HEADER_CAPACITY);

    let profile_idc = profile_idc(pic);

    bw.put_bits(NAL_HEADER_PPS, 8);
    bw.put_ue(0); // pic_parameter_set_id
    bw.put_ue(0); // seq_parameter_set_id
    bw.put_bits(u32::from(pic.pic_fields.entropy_coding_mode_flag), 1);
    bw.put_bits(u32::from(pic.pic_fields.pic_order_present_flag), 1);
    bw.put_ue(0); // num_slice_groups_minus1, no FMO
    bw.put_ue(0); // num_ref_idx_l0_default_active_minus1
    bw.put_ue(0); // num_ref_idx_l1_default_active_minus1
    bw.put_bits(u32::from(pic.pic_fields.weighted_pred_flag), 1);
    bw.put_bits(pic.pic_fields.weighted_bipred_idc as u32, 2);
    bw.put_se(pic.pic_init_qp_minus26 as i32);
    bw.put_se(pic.pic_init_qs_minus26 as i32);
    bw.put_se(pic.chroma_qp_index_offset as i32);
    bw.put_bits(u32::from(pic.pic_fields.deblocking_filter_control_present_flag), 1);
    bw.put_bits(u32::from(pic.pic_fields.constrained_intra_pred_flag), 1);
    bw.put_bits(u32::from(pic.pic_fields.redundant_pic_cnt_present_flag), 1);

    if profile_idc >= 100 && pic.pic_fields.transform_8x8_mode_flag {
        bw.put_bits(1, 1); // transform_8x8_mode_flag
        bw.put_bits(0, 1); // pic_scaling_matrix_present_flag
        bw.put_se(pic.second_chroma_qp_index_offset as i32);
    }

    bw.finish()
}

/// Per-session H.264 header state: the latest synthesised SPS/PPS plus
/// whether they have been emitted into the stream since they last changed.
#[derive(Default)]
pub struct H264State {
    sps: Vec<u8>,
    pps: Vec<u8>,
    sps_pps_emitted: bool,
}

impl H264State {
    pub(crate) fn update(&mut self, pic: &PictureParameters) {
        let sps = generate_sps(pic);
        let pps = generate_pps(pic);

        if sps != self.sps || pps != self.pps {
            self.sps = sps;
            self.pps = pps;
            self.sps_pps_emitted = false;
            log::debug!(
                "H.264: new headers for {}x{} MBs, profile {}, level {}, {} reference frames",
                pic.picture_width_in_mbs_minus1 + 1,
                pic.picture_height_in_mbs_minus1 + 1,
                profile_idc(pic),
                level_idc(pic),
                pic.num_ref_frames
            );
        }
    }

    pub(crate) fn assemble(
        &mut self,
        bitstream: &mut Bitstream,
        slices: &[SliceParameter],
        data: &[u8],
    ) {
        for param in slices {
            let Some(payload) = slice_payload(data, param) else {
                log::warn!("H.264: slice parameters out of range, dropped");
                continue;
            };
            let Some(&first) = payload.first() else {
                continue;
            };

            if first & 0x1f == NAL_SLICE_IDR && !self.sps_pps_emitted {
                if !self.sps.is_empty() {
                    bitstream.append_nal(&self.sps);
                }
                if !self.pps.is_empty() {
                    bitstream.append_nal(&self.pps);
                }
                self.sps_pps_emitted = true;
            }

            bitstream.append_nal(payload);
        }
    }
}
