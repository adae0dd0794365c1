use mcasim_core::{Binary128, FloatFmt, FpClass};
use proptest::prelude::*;

/// A finite f64 with a bounded exponent, keeping intermediate products and
/// sums inside the binary128 normal range.
fn moderate_f64() -> impl Strategy<Value = f64> {
    (any::<i64>(), -300i32..300, prop::bool::ANY).prop_map(|(m, e, sign)| {
        let mantissa = (m.unsigned_abs() % (1 << 52)) | (1 << 52);
        let x = (mantissa as f64) * (2.0f64).powi(e - 52);
        if sign { -x } else { x }
    })
}

#[test]
fn widening_is_exact_for_every_class() {
    for &x in &[
        0.0,
        -0.0,
        1.0,
        -1.5,
        0.1,
        f64::MAX,
        f64::MIN_POSITIVE,
        5e-324,
        -5e-324,
        f64::INFINITY,
        f64::NEG_INFINITY,
    ] {
        let wide = Binary128::from(x);
        let narrow = wide.to_f64();
        assert_eq!(
            narrow.to_bits(),
            x.to_bits(),
            "round trip changed {x:e}: {:x}",
            wide.to_bits()
        );
    }
    assert!(Binary128::from(f64::NAN).is_nan());
    assert!(Binary128::from(f64::NAN).to_f64().is_nan());
}

#[test]
fn known_bit_patterns() {
    assert_eq!(Binary128::from(1.0).to_bits(), 0x3FFF << 112);
    assert_eq!(Binary128::from(-2.0).to_bits(), (1 << 127) | (0x4000 << 112));
    // 1/3 rounds to 0.0101...01 with the repeating pattern filling the
    // 112-bit mantissa.
    let third = Binary128::from(1.0) / Binary128::from(3.0);
    assert_eq!(
        third.to_bits(),
        0x3FFD_5555_5555_5555_5555_5555_5555_5555
    );
}

#[test]
fn special_values_propagate() {
    let inf = Binary128::INFINITY;
    let one = Binary128::from(1.0);
    let zero = Binary128::ZERO;

    assert!((inf - inf).is_nan());
    assert!((zero * inf).is_nan());
    assert!((zero / zero).is_nan());
    assert!((inf / inf).is_nan());
    assert_eq!(inf + one, inf);
    assert_eq!(one / zero, inf);
    let neg_div = one / Binary128::NEG_ZERO;
    assert!(neg_div.is_infinite());
    assert!(neg_div.is_sign_negative());
    assert!((Binary128::NAN + one).is_nan());
    assert!(Binary128::NAN.mul_add(one, one).is_nan());
    assert!(inf.mul_add(zero, one).is_nan());
    assert!(inf.mul_add(one, Binary128::NEG_INFINITY).is_nan());
    assert_eq!(one.mul_add(one, inf), inf);
}

#[test]
fn signed_zero_rules() {
    let pz = Binary128::ZERO;
    let nz = Binary128::NEG_ZERO;
    assert!(!(pz + nz).is_sign_negative());
    assert!((nz + nz).is_sign_negative());
    assert_eq!(pz, nz);
    // x - x is +0 under round-to-nearest.
    let x = Binary128::from(0.1);
    assert!(!(x - x).is_sign_negative());
    assert!((x - x).is_zero());
    // Signs combine through multiplication.
    assert!((nz * Binary128::from(2.0)).is_sign_negative());
    assert!((Binary128::from(-1.0) * nz).to_f64() == 0.0);
}

#[test]
fn exact_sum_of_two_doubles_narrows_to_the_ieee_sum() {
    // With aligned exponents the exact sum fits in 113 bits, so the quad
    // addition is exact and the narrowing reproduces the native rounding.
    let a = 0.1f64;
    let b = 0.2f64;
    let sum = Binary128::from(a) + Binary128::from(b);
    assert_eq!(sum.to_f64(), a + b);
    // The quad sum itself is more accurate than the double sum: it differs
    // from the narrowed value.
    assert_ne!(sum, Binary128::from(a + b));
}

proptest! {
    #[test]
    fn product_of_doubles_is_exact_in_quad(a in moderate_f64(), b in moderate_f64()) {
        let p = Binary128::from(a) * Binary128::from(b);
        prop_assert_eq!(p.to_f64(), a * b);
    }

    #[test]
    fn aligned_sums_match_the_native_sum(a in moderate_f64(), shift in -55i32..55) {
        // Keep both addends within 55 binades so the exact sum fits the
        // 113-bit significand.
        let b = a.scale_pow2(shift) * 0.7298743;
        let s = Binary128::from(a) + Binary128::from(b);
        prop_assert_eq!(s.to_f64(), a + b);
    }

    #[test]
    fn quotients_match_the_native_quotient(a in moderate_f64(), b in moderate_f64()) {
        prop_assume!(b != 0.0);
        let q = Binary128::from(a) / Binary128::from(b);
        prop_assert_eq!(q.to_f64(), a / b);
    }

    #[test]
    fn fused_multiply_add_matches_the_native_fma(
        a in moderate_f64(),
        b in moderate_f64(),
        c in moderate_f64(),
    ) {
        let r = Binary128::from(a).mul_add(Binary128::from(b), Binary128::from(c));
        prop_assert_eq!(r.to_f64(), a.mul_add(b, c));
    }

    #[test]
    fn ordering_matches_f64(a in moderate_f64(), b in moderate_f64()) {
        prop_assert_eq!(
            Binary128::from(a).partial_cmp(&Binary128::from(b)),
            a.partial_cmp(&b)
        );
    }
}

#[test]
fn narrowing_rounds_to_nearest_even() {
    // 2^-1075 is a tie between 0 and the smallest subnormal; even wins.
    let half_smallest = Binary128::from(5e-324) * Binary128::from(0.5);
    assert_eq!(half_smallest.to_f64(), 0.0);
    // 1.5 * 2^-1075 is above the tie and rounds up.
    let above = Binary128::from(5e-324) * Binary128::from(0.75);
    assert_eq!(above.to_f64(), 5e-324);
    // Values beyond the f64 range overflow to infinity.
    let big = Binary128::from(f64::MAX) * Binary128::from(2.0);
    assert_eq!(big.to_f64(), f64::INFINITY);
}

#[test]
fn narrowing_to_f32_rounds_once() {
    let third = Binary128::from(1.0) / Binary128::from(3.0);
    assert_eq!(third.to_f32(), 1.0f32 / 3.0f32);
    assert_eq!(Binary128::from(f64::MAX).to_f32(), f32::INFINITY);
    assert_eq!(Binary128::from(1e-60).to_f32(), 0.0);
}

#[test]
fn scale_pow2_is_exact_scaling() {
    let x = Binary128::from(0.1);
    let scaled = x.scale_pow2(40);
    assert_eq!(scaled.to_f64(), 0.1 * (2.0f64).powi(40));
    // Round trip through the exponent is lossless in range.
    assert_eq!(scaled.scale_pow2(-40), x);
    // Out of range saturates.
    assert!(x.scale_pow2(20000).is_infinite());
    assert!(x.scale_pow2(-20000).is_zero());
}

#[test]
fn quad_classification_and_representability() {
    assert_eq!(Binary128::ZERO.fp_class(), FpClass::Zero);
    assert_eq!(Binary128::NAN.fp_class(), FpClass::Nan);
    assert_eq!(Binary128::INFINITY.fp_class(), FpClass::Infinite);
    assert_eq!(Binary128::from(1.0).fp_class(), FpClass::Normal);
    let subnormal = Binary128::from_bits(1);
    assert_eq!(subnormal.fp_class(), FpClass::Subnormal);

    // A widened double has at least 60 trailing mantissa zeros, so it is
    // representable at the binary64 precision inside binary128.
    let wide = Binary128::from(0.1);
    assert!(wide.is_representable_at(53));
    assert!(!(Binary128::from(1.0) / Binary128::from(3.0)).is_representable_at(53));
}

#[test]
fn quad_daz_ftz_flush_subnormals_with_sign() {
    let negative_subnormal = Binary128::from_bits((1 << 127) | 1);
    let flushed = negative_subnormal.daz();
    assert!(flushed.is_zero());
    assert!(flushed.is_sign_negative());
    assert_eq!(Binary128::from(1.0).ftz(), Binary128::from(1.0));
}
