use mcasim_core::backends::bitmask::{
    BitmaskConf, BitmaskContext, BitmaskMode, BitmaskOperator,
};
use mcasim_core::{Backend, Dispatch};
use proptest::prelude::*;

fn load(conf: BitmaskConf) -> Dispatch<BitmaskContext> {
    let mut ctx = BitmaskContext::pre_init();
    ctx.configure(&conf).unwrap();
    Dispatch::load(ctx)
}

#[test]
fn default_configuration_is_transparent() {
    // Full mantissa precision: the mask is all ones and zero-masking keeps
    // every bit.
    let host = load(BitmaskConf::default());
    assert_eq!(host.add_binary64(0.1, 0.2), 0.1 + 0.2);
    assert_eq!(host.add_binary32(0.1f32, 0.2f32), 0.1f32 + 0.2f32);
}

#[test]
fn ieee_mode_never_touches_the_result() {
    let host = load(BitmaskConf {
        mode: BitmaskMode::Ieee,
        operator: BitmaskOperator::One,
        precision_binary32: 5,
        precision_binary64: 5,
        ..BitmaskConf::default()
    });
    assert_eq!(host.add_binary64(0.1, 0.2), 0.1 + 0.2);
    assert_eq!(host.mul_binary32(0.1f32, 0.7f32), 0.1f32 * 0.7f32);
}

#[test]
fn zero_operator_truncates_the_output_mantissa() {
    // Output masking at 10 bits: the result keeps the top 10 stored
    // mantissa bits of the native sum.
    let host = load(BitmaskConf {
        precision_binary32: 10,
        ..BitmaskConf::default()
    });
    let result = host.add_binary32(1.0f32, 0.1f32);
    let native = 1.0f32 + 0.1f32;
    let expected = f32::from_bits(native.to_bits() & (u32::MAX << 13));
    assert_eq!(result.to_bits(), expected.to_bits());
}

#[test]
fn one_operator_saturates_the_low_bits() {
    let host = load(BitmaskConf {
        precision_binary64: 20,
        operator: BitmaskOperator::One,
        ..BitmaskConf::default()
    });
    let result = host.add_binary64(1.0, 0.1);
    let native: f64 = 1.0 + 0.1;
    assert_eq!(
        result.to_bits(),
        native.to_bits() | ((1u64 << 32) - 1),
        "bottom 32 mantissa bits must read all ones"
    );
}

proptest! {
    #[test]
    fn zero_masking_clears_the_bits_below_the_precision(
        a in -1.0e30f64..1.0e30,
        b in -1.0e30f64..1.0e30,
        precision in 1u32..=52,
    ) {
        let host = load(BitmaskConf {
            precision_binary64: precision as i32,
            ..BitmaskConf::default()
        });
        let result = host.add_binary64(a, b);
        prop_assume!(result.is_normal());
        let low = result.to_bits() & ((1u64 << (52 - precision)) - 1);
        prop_assert_eq!(low, 0, "result {:e} kept bits below p={}", result, precision);
    }

    #[test]
    fn random_masking_preserves_the_top_mantissa_bits(
        a in -1.0e10f64..1.0e10,
        b in 0.5f64..1.0e10,
    ) {
        let host = load(BitmaskConf {
            precision_binary64: 40,
            operator: BitmaskOperator::Rand,
            seed: Some(42),
            ..BitmaskConf::default()
        });
        let result = host.div_binary64(a, b);
        let native = a / b;
        prop_assume!(native.is_normal());
        // Sign, exponent and the top 40 mantissa bits survive untouched.
        prop_assert_eq!(result.to_bits() >> 12, native.to_bits() >> 12);
    }
}

#[test]
fn random_masking_is_unbiased_at_the_masked_ulp() {
    let host = load(BitmaskConf {
        precision_binary64: 40,
        operator: BitmaskOperator::Rand,
        seed: Some(42),
        ..BitmaskConf::default()
    });
    let native = 1.0 / 3.0;
    let samples: Vec<f64> = (0..1000).map(|_| host.div_binary64(1.0, 3.0)).collect();
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    // XORing 12 random bits keeps every sample within 2^-42 of the native
    // quotient and the mean much closer.
    for s in &samples {
        assert!((s - native).abs() < (2.0f64).powi(-41));
        assert_eq!(s.to_bits() >> 12, native.to_bits() >> 12);
    }
    assert!((mean - native).abs() < (2.0f64).powi(-39));
}

#[test]
fn input_masking_modes_touch_the_operands() {
    // ib with the one-operator on inputs: 1.0 gains low mantissa bits
    // before the addition, so the result exceeds the native sum.
    let host = load(BitmaskConf {
        precision_binary64: 10,
        mode: BitmaskMode::Ib,
        operator: BitmaskOperator::One,
        ..BitmaskConf::default()
    });
    let result = host.add_binary64(1.0, 1.0);
    assert!(result > 2.0);

    // full applies both sides.
    let host = load(BitmaskConf {
        precision_binary64: 10,
        mode: BitmaskMode::Full,
        operator: BitmaskOperator::Zero,
        ..BitmaskConf::default()
    });
    let result = host.add_binary64(0.1, 0.2);
    assert_eq!(result.to_bits() & ((1u64 << 42) - 1), 0);
}

#[test]
fn ob_mode_skips_values_already_representable() {
    // 2.0 has an empty mantissa: representable at any precision, so even
    // the one-operator leaves it alone in ob mode.
    let host = load(BitmaskConf {
        precision_binary64: 10,
        operator: BitmaskOperator::One,
        ..BitmaskConf::default()
    });
    assert_eq!(host.add_binary64(1.0, 1.0), 2.0);
}

#[test]
fn specials_pass_through_unmasked() {
    let host = load(BitmaskConf {
        precision_binary64: 4,
        precision_binary32: 4,
        operator: BitmaskOperator::One,
        ..BitmaskConf::default()
    });
    assert!(host.add_binary64(f64::NAN, 1.0).is_nan());
    assert_eq!(host.add_binary64(f64::INFINITY, 1.0), f64::INFINITY);
    assert_eq!(host.mul_binary64(0.0, 25.0), 0.0);
    assert_eq!(host.add_binary32(f32::NEG_INFINITY, 1.0), f32::NEG_INFINITY);
}

#[test]
fn tiny_subnormals_are_left_alone() {
    // The leading-zero adjustment widens the mask until nothing below the
    // significant range is touched; for the smallest subnormal the mask is
    // all ones.
    let host = load(BitmaskConf {
        precision_binary64: 10,
        operator: BitmaskOperator::One,
        ..BitmaskConf::default()
    });
    let smallest = f64::from_bits(1);
    assert_eq!(host.add_binary64(smallest, 0.0), smallest);
}

#[test]
fn daz_and_ftz_flush_subnormals() {
    let host = load(BitmaskConf {
        daz: true,
        ..BitmaskConf::default()
    });
    let subnormal = f64::from_bits(1);
    assert_eq!(host.add_binary64(subnormal, subnormal), 0.0);

    let host = load(BitmaskConf {
        ftz: true,
        ..BitmaskConf::default()
    });
    let flushed = host.mul_binary64(-5e-324, 1.0);
    assert_eq!(flushed, 0.0);
    assert!(flushed.is_sign_negative());
}

#[test]
fn fma_and_cast_are_masked_operations() {
    let host = load(BitmaskConf {
        precision_binary64: 10,
        precision_binary32: 10,
        ..BitmaskConf::default()
    });
    let fma = host.fma_binary64(0.1, 0.7, 0.3);
    assert_eq!(fma.to_bits() & ((1u64 << 42) - 1), 0);

    let cast = host.cast_binary64_to_binary32(0.1);
    // The cast masks its binary64 intermediate at the binary64 precision.
    let expected = f64::from_bits(f64::from(0.1f64 as f32).to_bits() & (u64::MAX << 42)) as f32;
    assert_eq!(cast, expected);
}

#[test]
fn invalid_precision_is_rejected() {
    let mut ctx = BitmaskContext::pre_init();
    assert!(ctx.set_precision_binary32(0).is_err());
    assert!(ctx.set_precision_binary64(-3).is_err());
    assert!(ctx.set_precision_binary64(52).is_ok());
}

#[test]
fn comparison_is_not_intercepted() {
    let host = load(BitmaskConf {
        precision_binary64: 2,
        ..BitmaskConf::default()
    });
    // Falls back to the native predicate evaluation.
    assert!(host.cmp_binary64(mcasim_core::FcmpPredicate::Olt, 1.0, 2.0));
    assert!(!host.cmp_binary64(mcasim_core::FcmpPredicate::Olt, f64::NAN, 2.0));
}
