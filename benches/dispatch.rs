//! Dispatch benchmarks
//!
//! Measures method lookup through class chains of growing depth, and
//! property access through declared properties and the `_get` fallback.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use qnative::abi::{CreateFn, DestroyFn, GetterFn, MethodFn, SetterFn};
use qnative::{
    CallStatus, ClassRegistrar, EmbeddedLibrary, MethodInfo, NativeCallback, ObjectId,
    PropertyInfo, RpcMode, Runtime, RuntimeConfig, ScriptInstance, Variant, VariantType,
};
use std::ffi::c_void;
use std::sync::Arc;

unsafe extern "C" fn create(_: ObjectId, _: *mut c_void) -> *mut c_void {
    Box::into_raw(Box::new(0i64)) as *mut c_void
}

unsafe extern "C" fn destroy(_: ObjectId, _: *mut c_void, user_data: *mut c_void) {
    drop(Box::from_raw(user_data as *mut i64));
}

unsafe extern "C" fn bump(
    _: ObjectId,
    _: *mut c_void,
    user_data: *mut c_void,
    _: usize,
    _: *const Variant,
    ret: *mut Variant,
) -> CallStatus {
    let counter = &mut *(user_data as *mut i64);
    *counter += 1;
    *ret = Variant::Int(*counter);
    CallStatus::Ok
}

unsafe extern "C" fn fallback_get(
    _: ObjectId,
    _: *mut c_void,
    user_data: *mut c_void,
    _: usize,
    _: *const Variant,
    ret: *mut Variant,
) -> CallStatus {
    *ret = Variant::Int(*(user_data as *const i64));
    CallStatus::Ok
}

unsafe extern "C" fn get_value(_: ObjectId, _: *mut c_void, user_data: *mut c_void, ret: *mut Variant) {
    *ret = Variant::Int(*(user_data as *const i64));
}

unsafe extern "C" fn set_value(_: ObjectId, _: *mut c_void, user_data: *mut c_void, value: *const Variant) {
    if let Some(v) = (*value).as_int() {
        *(user_data as *mut i64) = v;
    }
}

fn method(reg: &mut ClassRegistrar, class: &str, name: &str, func: MethodFn) {
    reg.register_method(class, MethodInfo::new(name), RpcMode::Disabled, NativeCallback::new(func))
        .unwrap();
}

/// `L0 <- L1 <- ... <- L{depth-1}`; every level defines `tick`, only the
/// root defines `root_only`, the `value` property and `_get`
fn chain_library(depth: usize) -> EmbeddedLibrary {
    EmbeddedLibrary::new(format!("res://bench_{}", depth)).on_init(move |reg| {
        for level in 0..depth {
            let name = format!("L{}", level);
            let base = if level == 0 { "Reference".to_string() } else { format!("L{}", level - 1) };
            reg.register_class(
                &name,
                &base,
                Some(NativeCallback::new(create as CreateFn)),
                NativeCallback::new(destroy as DestroyFn),
            )
            .map_err(|e| e.to_string())?;
            method(reg, &name, "tick", bump);
        }
        method(reg, "L0", "root_only", bump);
        method(reg, "L0", "_get", fallback_get);
        reg.register_property(
            "L0",
            PropertyInfo::new("value", VariantType::Int),
            Variant::Int(0),
            RpcMode::Disabled,
            NativeCallback::new(set_value as SetterFn),
            NativeCallback::new(get_value as GetterFn),
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    })
}

fn setup(depth: usize) -> (Arc<Runtime>, Arc<ScriptInstance>) {
    let runtime = Runtime::new(RuntimeConfig::default());
    let library = runtime.load_library(chain_library(depth));
    let script = runtime.create_script(&library, &format!("L{}", depth - 1));
    let instance = script.create_instance(ObjectId(1)).unwrap();
    (runtime, instance)
}

fn bench_call(c: &mut Criterion) {
    let mut group = c.benchmark_group("call");

    for depth in [1, 4, 16].iter() {
        let (_runtime, instance) = setup(*depth);

        group.bench_with_input(BenchmarkId::new("most_derived", depth), depth, |b, _| {
            b.iter(|| instance.call(black_box("tick"), &[]).unwrap());
        });

        group.bench_with_input(BenchmarkId::new("root_only", depth), depth, |b, _| {
            b.iter(|| instance.call(black_box("root_only"), &[]).unwrap());
        });

        group.bench_with_input(BenchmarkId::new("missing", depth), depth, |b, _| {
            b.iter(|| instance.call(black_box("missing"), &[]).is_err());
        });
    }

    group.finish();
}

fn bench_multilevel(c: &mut Criterion) {
    let mut group = c.benchmark_group("call_multilevel");

    for depth in [1, 4, 16].iter() {
        let (_runtime, instance) = setup(*depth);

        group.bench_with_input(BenchmarkId::new("derived_first", depth), depth, |b, _| {
            b.iter(|| instance.call_multilevel(black_box("tick"), &[]).unwrap());
        });

        group.bench_with_input(BenchmarkId::new("base_first", depth), depth, |b, _| {
            b.iter(|| instance.call_multilevel_reversed(black_box("tick"), &[]).unwrap());
        });
    }

    group.finish();
}

fn bench_properties(c: &mut Criterion) {
    let mut group = c.benchmark_group("properties");
    let (_runtime, instance) = setup(4);

    group.bench_function("get_declared", |b| {
        b.iter(|| instance.get(black_box("value")).unwrap());
    });

    group.bench_function("set_declared", |b| {
        b.iter(|| instance.set(black_box("value"), Variant::Int(3)).unwrap());
    });

    group.bench_function("get_fallback", |b| {
        b.iter(|| instance.get(black_box("anything")).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_call, bench_multilevel, bench_properties);
criterion_main!(benches);
