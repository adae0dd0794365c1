use mcasim_core::ErrorMode;
use mcasim_core::fpbits::scale_pow2_f64;
use mcasim_core::vprec::{Direction, Preset, VprecConf, VprecContext, round_binary32, round_binary64};
use proptest::prelude::*;
use rstest::rstest;

fn ctx(precision: i32, range: i32) -> VprecContext {
    VprecContext::from_conf(&VprecConf {
        precision_binary32: precision.min(23),
        range_binary32: range.min(8),
        precision_binary64: precision,
        range_binary64: range,
        ..VprecConf::default()
    })
    .unwrap()
}

#[test]
fn full_precision_is_the_identity() {
    let c = ctx(52, 11);
    for &x in &[0.1, -0.1, 1.0, 5e-324, f64::MAX, -0.0, f64::INFINITY] {
        let rounded = round_binary64(x, Direction::Output, &c);
        assert_eq!(rounded.to_bits(), x.to_bits());
    }
    assert!(round_binary64(f64::NAN, Direction::Output, &c).is_nan());
}

#[test]
fn ties_resolve_on_the_lowest_kept_bit() {
    // 1 + 2^-51 + 2^-52 sits exactly halfway at precision 51; the kept bit
    // is odd, so the value rounds up to 1 + 2^-50.
    let c = ctx(51, 11);
    let x = f64::from_bits(0x3FF0_0000_0000_0003);
    let rounded = round_binary64(x, Direction::Output, &c);
    assert_eq!(rounded.to_bits(), 0x3FF0_0000_0000_0004);

    // With an even kept bit the same halfway pattern rounds down.
    let y = f64::from_bits(0x3FF0_0000_0000_0001);
    let rounded = round_binary64(y, Direction::Output, &c);
    assert_eq!(rounded.to_bits(), 0x3FF0_0000_0000_0000);
}

#[test]
fn binary16_preset_reproduces_half_precision_values() {
    let mut c = VprecContext::default();
    c.apply_preset(Preset::Binary16);
    let rounded = round_binary64(0.1, Direction::Output, &c);
    // 0.1 at 10 mantissa bits: round(0.1 * 2^14) / 2^14.
    let expected = (0.1f64 * 16384.0).round_ties_even() / 16384.0;
    assert_eq!(rounded, expected);
}

#[test]
fn overflow_in_the_target_range_produces_a_signed_infinity() {
    let c = ctx(10, 5);
    assert_eq!(round_binary64(1e30, Direction::Output, &c), f64::INFINITY);
    assert_eq!(
        round_binary64(-1e30, Direction::Output, &c),
        f64::NEG_INFINITY
    );
    assert_eq!(round_binary32(1e30f32, Direction::Output, &c), f32::INFINITY);
}

#[test]
fn daz_and_ftz_flush_below_the_target_range_with_sign() {
    let conf = VprecConf {
        precision_binary64: 10,
        range_binary64: 5,
        daz: true,
        ftz: true,
        ..VprecConf::default()
    };
    let c = VprecContext::from_conf(&conf).unwrap();
    // emin is -14 for a 5-bit range.
    let tiny = -(2.0f64).powi(-20);
    let input = round_binary64(tiny, Direction::Input, &c);
    assert_eq!(input, 0.0);
    assert!(input.is_sign_negative());
    let output = round_binary64(tiny, Direction::Output, &c);
    assert_eq!(output, 0.0);
    assert!(output.is_sign_negative());
}

#[test]
fn denormal_rounding_snaps_to_the_target_grid() {
    // Target binary16-like: p = 10, r = 5, emin = -14, smallest subnormal
    // 2^-24, half of it 2^-25.
    let c = ctx(10, 5);
    // A representable target subnormal passes through.
    let x = 1.5 * (2.0f64).powi(-15);
    assert_eq!(round_binary64(x, Direction::Output, &c), x);
    // Exactly half the smallest subnormal rounds up to it.
    let half = (2.0f64).powi(-25);
    assert_eq!(round_binary64(half, Direction::Output, &c), (2.0f64).powi(-24));
    // Below half flushes to a signed zero.
    let below = (2.0f64).powi(-26);
    assert_eq!(round_binary64(below, Direction::Output, &c), 0.0);
    let below_neg = round_binary64(-below, Direction::Output, &c);
    assert_eq!(below_neg, 0.0);
    assert!(below_neg.is_sign_negative());
    // A value needing mantissa rounding inside the subnormal range.
    let y = f64::from_bits((2.0f64).powi(-16).to_bits() | 1);
    let rounded = round_binary64(y, Direction::Output, &c);
    assert_eq!(rounded, (2.0f64).powi(-16));
}

#[test]
fn absolute_error_caps_the_effective_precision() {
    let conf = VprecConf {
        precision_binary64: 52,
        range_binary64: 11,
        error_mode: ErrorMode::Abs,
        max_abs_error_exponent: Some(-10),
        ..VprecConf::default()
    };
    let c = VprecContext::from_conf(&conf).unwrap();
    // 0.4 quantized to multiples of 2^-10.
    let rounded = round_binary64(0.4, Direction::Output, &c);
    assert_eq!(rounded, (0.4f64 * 1024.0).round_ties_even() / 1024.0);
    // Just below the threshold: exactly one ulp of the absolute format.
    let just_below = 1.5 * (2.0f64).powi(-11);
    assert_eq!(
        round_binary64(just_below, Direction::Output, &c),
        (2.0f64).powi(-10)
    );
    assert_eq!(
        round_binary64(-just_below, Direction::Output, &c),
        -(2.0f64).powi(-10)
    );
    // Far below the threshold: zero, sign preserved.
    let far_below = round_binary64(-(2.0f64).powi(-14), Direction::Output, &c);
    assert_eq!(far_below, 0.0);
    assert!(far_below.is_sign_negative());
}

#[test]
fn combined_error_modes_take_the_tighter_precision() {
    let conf = VprecConf {
        precision_binary64: 8,
        range_binary64: 11,
        error_mode: ErrorMode::All,
        max_abs_error_exponent: Some(-20),
        ..VprecConf::default()
    };
    let c = VprecContext::from_conf(&conf).unwrap();
    // exp(0.4) - (-20) = 18 > 8: the relative precision dominates, giving
    // the same grid as a plain 8-bit rounding.
    let rounded = round_binary64(0.4, Direction::Output, &c);
    let expected = scale_pow2_f64((0.4f64 * 1024.0).round_ties_even(), -10);
    assert_eq!(rounded, expected);
}

#[rstest]
#[case(1)]
#[case(7)]
#[case(23)]
fn binary32_rounding_is_idempotent(#[case] precision: i32) {
    let c = ctx(precision, 8);
    for &x in &[0.1f32, -1.234e-5, 3.4e38, 6.1e-39, 1.0] {
        let once = round_binary32(x, Direction::Output, &c);
        let twice = round_binary32(once, Direction::Output, &c);
        assert_eq!(once.to_bits(), twice.to_bits(), "p={precision} x={x:e}");
    }
}

proptest! {
    #[test]
    fn rounding_is_idempotent(
        bits in any::<u64>(),
        precision in 1i32..=52,
        range in 2i32..=11,
    ) {
        let x = f64::from_bits(bits);
        let c = ctx(precision, range);
        let once = round_binary64(x, Direction::Output, &c);
        let twice = round_binary64(once, Direction::Output, &c);
        if once.is_nan() {
            prop_assert!(twice.is_nan());
        } else {
            prop_assert_eq!(once.to_bits(), twice.to_bits());
        }
    }

    #[test]
    fn rounded_values_carry_at_most_the_target_precision(
        bits in any::<u64>(),
        precision in 1i32..=52,
    ) {
        let x = f64::from_bits(bits);
        prop_assume!(x.is_finite());
        let c = ctx(precision, 11);
        let rounded = round_binary64(x, Direction::Output, &c);
        // Normal results keep only `precision` stored mantissa bits.
        if rounded.is_normal() {
            let mantissa = rounded.to_bits() & 0x000F_FFFF_FFFF_FFFF;
            let k = 52 - precision as u32;
            prop_assert_eq!(mantissa & ((1u64 << k) - 1), 0);
        }
    }
}

#[test]
fn range_and_precision_are_validated() {
    let mut c = VprecContext::default();
    assert!(c.set_precision_binary64(0).is_err());
    assert!(c.set_precision_binary64(53).is_err());
    assert!(c.set_range_binary64(1).is_err());
    assert!(c.set_range_binary64(12).is_err());
    assert!(c.set_range_binary32(9).is_err());
    assert!(c.set_precision_binary32(24).is_err());
    assert!(c.set_precision_binary64(52).is_ok());
    assert!(c.set_range_binary64(2).is_ok());
}
