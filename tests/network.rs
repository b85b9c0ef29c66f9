//! Boundary-scenario tests that exercise layer construction, dispatch geometry, and rejection
//! rules without a live GPU device: the pieces of §8's scenarios that are pure host-side logic.

use texinfer::conv::ShallowConvLayer;
use texinfer::layer::builder::ConvParams;
use texinfer::layer::{Layer, LayerFlags};
use texinfer::tensor::{ElementType, Tiler};

fn conv_params(kernel_size: u32, group: u32) -> ConvParams {
    ConvParams {
        kernel_size,
        stride: 1,
        dilation: 1,
        group,
    }
}

#[test]
fn one_by_one_convolution_declares_a_single_tap_weight_array() {
    // 1x1 convolution summing 4 input channels into 4 output channels: one tap per input tile.
    let layer = ShallowConvLayer::new(
        0,
        "sum1x1",
        8,
        8,
        4,
        4,
        ElementType::Float16,
        conv_params(1, 1),
        LayerFlags::default(),
        1.0,
    )
    .unwrap();
    assert_eq!(layer.weight_len(1), 1 * 1 * 4 * 1 * 1);
    assert_eq!(layer.output_specs()[0].channels, 4);
}

#[test]
fn three_by_three_depthwise_is_accepted_and_uses_degenerate_weight_layout() {
    let layer = ShallowConvLayer::new(
        0,
        "depthwise3x3",
        8,
        8,
        4,
        4,
        ElementType::Float16,
        conv_params(3, 4),
        LayerFlags::default(),
        1.0,
    )
    .unwrap();
    // depthwise layout: k*k*4*out_tiles, independent of requested batch width.
    assert_eq!(layer.weight_len(1), layer.weight_len(4));
    assert_eq!(layer.weight_len(1), 3 * 3 * 4 * 1);
}

#[test]
fn deep_tile_grid_covers_every_channel_tile_exactly_once() {
    let tiler = Tiler::new(16, 16, 20, 0, 4096).expect("grid fits under max texture dim");
    let mut seen = std::collections::HashSet::new();
    for tile in tiler.tiles() {
        seen.insert(tile.channel_base);
    }
    assert_eq!(seen.len(), tiler.num_tiles() as usize);
}

#[test]
fn concat_fast_path_relabels_without_channel_loss() {
    use texinfer::concat::ConcatLayer;
    use texinfer::layer::base::Activation;

    let layer = ConcatLayer::new(
        0,
        "concat",
        8,
        8,
        ElementType::Float16,
        vec![4, 4, 12],
        &[Activation::None; 3],
    )
    .unwrap();
    assert!(layer.is_fast_path());
    let handles = vec![];
    assert_eq!(layer.run_fast_path(&handles).len(), 0);
    assert_eq!(layer.total_channels(), 20);
}

#[test]
fn concat_slow_path_is_used_when_any_port_is_not_a_multiple_of_four() {
    use texinfer::concat::ConcatLayer;
    use texinfer::layer::base::Activation;

    let layer = ConcatLayer::new(
        0,
        "concat",
        8,
        8,
        ElementType::Float16,
        vec![3, 5, 8],
        &[Activation::None; 3],
    )
    .unwrap();
    assert!(!layer.is_fast_path());
    assert_eq!(layer.total_channels(), 16);
}

#[test]
fn transpose_conv_stratum_zero_carries_the_most_taps() {
    use texinfer::conv::transpose::strata_for_kernel;

    let strata = strata_for_kernel(3);
    assert_eq!(strata.len(), 4);
    let max_taps = strata.iter().map(|s| s.tap_count).max().unwrap();
    assert_eq!(strata[0].tap_count, max_taps);
}

#[test]
fn token_scoring_pads_last_segment_for_non_divisible_vocab() {
    use texinfer::embedding::scoring::pad_last_segment;

    assert_eq!(pad_last_segment(50_257, 256), 256 - (50_257 % 256));
}
