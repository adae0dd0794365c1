use mcasim_core::fpbits::scale_pow2_f64;
use mcasim_core::{FloatFmt, FpClass};

#[test]
fn classify_covers_all_classes() {
    assert_eq!(0.0f64.fp_class(), FpClass::Zero);
    assert_eq!((-0.0f64).fp_class(), FpClass::Zero);
    assert_eq!(5e-324f64.fp_class(), FpClass::Subnormal);
    assert_eq!(1.5f64.fp_class(), FpClass::Normal);
    assert_eq!(f64::INFINITY.fp_class(), FpClass::Infinite);
    assert_eq!(f64::NAN.fp_class(), FpClass::Nan);

    assert_eq!(f32::from_bits(1).fp_class(), FpClass::Subnormal);
    assert_eq!(f32::NEG_INFINITY.fp_class(), FpClass::Infinite);
}

#[test]
fn unbiased_exponent_reads_the_raw_field() {
    assert_eq!(1.0f64.unbiased_exponent(), 0);
    assert_eq!(2.0f64.unbiased_exponent(), 1);
    assert_eq!(0.75f64.unbiased_exponent(), -1);
    assert_eq!(1.0f32.unbiased_exponent(), 0);
    // Zeros and subnormals report the raw field minus the bias; the
    // cancellation detector depends on this.
    assert_eq!(0.0f64.unbiased_exponent(), -1023);
    assert_eq!(0.0f32.unbiased_exponent(), -127);
    assert_eq!(5e-324f64.unbiased_exponent(), -1023);
}

#[test]
fn fast_pow2_matches_the_exponent_field() {
    assert_eq!(<f64 as FloatFmt>::fast_pow2(0), 1.0);
    assert_eq!(<f64 as FloatFmt>::fast_pow2(10), 1024.0);
    assert_eq!(<f64 as FloatFmt>::fast_pow2(-3), 0.125);
    assert_eq!(<f32 as FloatFmt>::fast_pow2(8), 256.0);
}

#[test]
fn representability_boundary_is_the_trailing_zero_count() {
    // 1.0 + 2^-10: mantissa has a single set bit at position 42, so 42
    // trailing zeros. pman - p <= 42 means p >= 10.
    let x = 1.0f64 + (2.0f64).powi(-10);
    assert!(x.is_representable_at(10));
    assert!(x.is_representable_at(11));
    assert!(!x.is_representable_at(9));
    // A zero mantissa is representable at any precision.
    assert!(2.0f64.is_representable_at(1));
    // Precisions past the mantissa width always hold.
    assert!(0.1f64.is_representable_at(52));
    assert!(!0.1f64.is_representable_at(40));
}

#[test]
fn daz_and_ftz_preserve_the_sign_of_the_flushed_zero() {
    let negative_subnormal = f64::from_bits(0x8000_0000_0000_0001);
    let flushed = negative_subnormal.daz();
    assert_eq!(flushed, 0.0);
    assert!(flushed.is_sign_negative());

    let positive_subnormal = f32::from_bits(0x0000_0001);
    let flushed = positive_subnormal.ftz();
    assert_eq!(flushed, 0.0);
    assert!(!flushed.is_sign_negative());

    // Everything else passes through.
    assert_eq!(1.5f64.daz(), 1.5);
    assert!(f64::NAN.daz().is_nan());
}

#[test]
fn scale_pow2_round_trips_through_the_subnormal_range() {
    let tiny = scale_pow2_f64(1.5, -1070);
    assert!(tiny > 0.0);
    assert_eq!(scale_pow2_f64(tiny, 1070), 1.5);
}

#[test]
fn scale_pow2_flushes_and_overflows() {
    assert_eq!(scale_pow2_f64(1.0, -2000), 0.0);
    assert!(scale_pow2_f64(-1.0, -2000).is_sign_negative());
    assert_eq!(scale_pow2_f64(1.0, 2000), f64::INFINITY);
    assert_eq!(scale_pow2_f64(-1.0, 2000), f64::NEG_INFINITY);
}

#[test]
fn scale_pow2_rounds_once_into_the_subnormal_range() {
    // 1.5 * 2^-1074 is halfway between 2^-1074 and 2^-1073; ties to even
    // picks 2^-1073.
    let x = 1.5f64;
    let scaled = x.scale_pow2(-1074);
    assert_eq!(scaled, scale_pow2_f64(1.0, -1073));
}

#[test]
fn f32_scaling_goes_through_f64_exactly() {
    let x = 1.9999999f32;
    assert_eq!(x.scale_pow2(3), x * 8.0);
    assert_eq!(x.scale_pow2(-200), 0.0);
    assert_eq!(x.scale_pow2(200), f32::INFINITY);
}
