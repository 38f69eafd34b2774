use super::*;
use crate::abi::{CallStatus, CreateFn, DestroyFn, MethodFn, NativeCallback};
use crate::host::{MethodInfo, RpcMode, Variant};
use crate::instance::ScriptInstance;
use crate::library::EmbeddedLibrary;
use std::cell::RefCell;
use std::sync::atomic::AtomicUsize;

unsafe extern "C" fn noop_destroy(_: ObjectId, _: *mut c_void, _: *mut c_void) {}

fn destroy() -> NativeCallback<DestroyFn> {
    NativeCallback::new(noop_destroy as DestroyFn)
}

/// Library registering one abstract class per `(name, base)` pair
fn library(path: &str, classes: &'static [(&'static str, &'static str)]) -> EmbeddedLibrary {
    EmbeddedLibrary::new(path).on_init(move |reg| {
        for (name, base) in classes {
            reg.register_class(name, base, None, destroy())
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    })
}

fn counting_hook(
    lib: EmbeddedLibrary,
    entry: EntryPoint,
    counter: &Arc<AtomicUsize>,
) -> EmbeddedLibrary {
    let counter = Arc::clone(counter);
    lib.on_hook(entry, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn test_script_initializes_library_inline_on_main() {
    let rt = Runtime::new(RuntimeConfig::default());
    let lib = rt.load_library(library("res://inline", &[("Player", "Node")]));
    assert_eq!(lib.state(), LibraryState::Loading);

    let script = rt.create_script(&lib, "Player");
    assert!(lib.is_initialized());
    assert!(!script.is_pending());
    assert!(script.resolve_descriptor().is_ok());
    assert_eq!(rt.class_names(lib.id()), vec!["Player".to_string()]);
    assert!(!rt.has_pending_work());
}

#[test]
fn test_load_library_dedupes_by_path() {
    let rt = Runtime::new(RuntimeConfig::default());
    let first = rt.load_library(library("res://same", &[("A", "Node")]));
    let second = rt.load_library(library("res://same", &[("B", "Node")]));
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(rt.libraries().len(), 1);

    rt.init_library(&first).unwrap();
    assert_eq!(rt.class_names(first.id()), vec!["A".to_string()]);
}

#[test]
fn test_worker_thread_defers_init() {
    let rt = Runtime::new(RuntimeConfig::default());
    let lib = rt.load_library(library("res://deferred", &[("Enemy", "Node")]));

    let worker = {
        let rt = Arc::clone(&rt);
        let lib = Arc::clone(&lib);
        thread::spawn(move || {
            let status = rt.init_library(&lib).unwrap();
            let script = rt.create_script(&lib, "Enemy");
            (status, script)
        })
    };
    let (status, script) = worker.join().unwrap();

    assert_eq!(status, InitStatus::Deferred);
    assert_eq!(lib.state(), LibraryState::AwaitingMainThreadInit);
    assert!(script.is_pending());
    assert!(script.resolve_descriptor().err().is_some_and(|e| e.is_retryable()));
    assert!(rt.has_pending_work());

    assert_eq!(rt.frame().unwrap(), 2);
    assert!(lib.is_initialized());
    assert!(!script.is_pending());
    assert!(script.resolve_descriptor().is_ok());
    assert!(!rt.has_pending_work());
    assert_eq!(rt.frame().unwrap(), 0);
}

#[test]
fn test_init_failure_terminates_library() {
    let rt = Runtime::new(RuntimeConfig::default());
    let lib = rt.load_library(
        EmbeddedLibrary::new("res://broken").on_init(|reg| {
            reg.register_class("Half", "Node", None, destroy())
                .map_err(|e| e.to_string())?;
            Err("missing asset".to_string())
        }),
    );

    match rt.init_library(&lib) {
        Err(ScriptError::LibraryInitFailed { library, reason }) => {
            assert_eq!(library, "res://broken");
            assert_eq!(reason, "missing asset");
        }
        other => panic!("expected init failure, got {other:?}"),
    }
    assert_eq!(lib.state(), LibraryState::Terminated);
    assert!(rt.class_names(lib.id()).is_empty());
    assert!(rt.find_descriptor(lib.id(), "Half").is_none());
    assert!(matches!(
        rt.init_library(&lib),
        Err(ScriptError::AlreadyTerminated { .. })
    ));
}

#[test]
fn test_registrar_failure_terminates_library() {
    let rt = Runtime::new(RuntimeConfig::default());
    let lib = rt.load_library(EmbeddedLibrary::new("res://refused").on_init(|reg| {
        reg.fail("license check failed");
        Ok(())
    }));
    assert!(matches!(
        rt.init_library(&lib),
        Err(ScriptError::LibraryInitFailed { .. })
    ));
    assert_eq!(lib.state(), LibraryState::Terminated);
}

#[test]
fn test_missing_entry_point_fails_init() {
    let rt = Runtime::new(RuntimeConfig::default());
    let lib = rt.load_library(EmbeddedLibrary::new("res://empty"));
    let err = rt.init_library(&lib).unwrap_err();
    assert!(err.to_string().contains("nativescript_init"));
}

#[test]
fn test_main_only_operations_refused_elsewhere() {
    let rt = Runtime::new(RuntimeConfig::default());
    let lib = rt.load_library(library("res://main", &[("A", "Node")]));

    let results = {
        let rt = Arc::clone(&rt);
        thread::spawn(move || {
            vec![
                rt.frame().map(|_| ()),
                rt.finish(),
                rt.reload_library(&lib).map(|_| ()),
                rt.unload_library(&lib),
                rt.reload_all().map(|_| ()),
                rt.init(),
            ]
        })
        .join()
        .unwrap()
    };

    for result in results {
        assert!(matches!(result, Err(ScriptError::NotMainContext { .. })));
    }
    assert!(!rt.is_finished());
}

#[test]
fn test_base_resolution_prefers_own_library() {
    let rt = Runtime::new(RuntimeConfig::default());
    let core = rt.load_library(library("res://core", &[("Shared", "Node"), ("Entity", "Node")]));
    let game = rt.load_library(library("res://game", &[("Shared", "Spatial"), ("Enemy", "Entity")]));
    rt.init_library(&core).unwrap();
    rt.init_library(&game).unwrap();

    let shared = rt.find_class(game.id(), "Shared").unwrap();
    assert_eq!(shared.library(), game.id());
    let entity = rt.find_class(game.id(), "Entity").unwrap();
    assert_eq!(entity.library(), core.id());

    let enemy = rt.find_descriptor(game.id(), "Enemy").unwrap();
    assert_eq!(enemy.base_native_type(&*rt), "Node");
    assert!(enemy.is_base_resolved());
}

#[test]
fn test_frame_and_thread_hooks() {
    let frames = Arc::new(AtomicUsize::new(0));
    let threads = Arc::new(AtomicUsize::new(0));

    let rt = Runtime::new(RuntimeConfig::default());
    let lib = library("res://hooks", &[("A", "Node")]);
    let lib = counting_hook(lib, EntryPoint::Frame, &frames);
    let lib = counting_hook(lib, EntryPoint::ThreadEnter, &threads);
    let lib = rt.load_library(counting_hook(lib, EntryPoint::ThreadExit, &threads));

    // hooks only run for initialized libraries
    rt.frame().unwrap();
    assert_eq!(frames.load(Ordering::SeqCst), 0);

    rt.init_library(&lib).unwrap();
    rt.frame().unwrap();
    rt.frame().unwrap();
    rt.thread_enter();
    rt.thread_exit();
    assert_eq!(frames.load(Ordering::SeqCst), 2);
    assert_eq!(threads.load(Ordering::SeqCst), 2);
}

#[test]
fn test_hooks_disabled_by_config() {
    let frames = Arc::new(AtomicUsize::new(0));
    let mut config = RuntimeConfig::default();
    config.runtime.call_frame_hooks = false;
    config.runtime.call_thread_hooks = false;

    let rt = Runtime::new(config);
    let lib = counting_hook(library("res://quiet", &[]), EntryPoint::Frame, &frames);
    let lib = rt.load_library(counting_hook(lib, EntryPoint::ThreadEnter, &frames));
    rt.init_library(&lib).unwrap();

    rt.frame().unwrap();
    rt.thread_enter();
    assert_eq!(frames.load(Ordering::SeqCst), 0);
}

#[test]
fn test_finish_runs_once() {
    let terminated = Arc::new(AtomicUsize::new(0));
    let rt = Runtime::new(RuntimeConfig::default());
    let first = rt.load_library(counting_hook(
        library("res://first", &[("A", "Node")]),
        EntryPoint::Terminate,
        &terminated,
    ));
    let second = rt.load_library(counting_hook(
        library("res://second", &[("B", "A")]),
        EntryPoint::Terminate,
        &terminated,
    ));
    rt.init_library(&first).unwrap();
    rt.init_library(&second).unwrap();

    rt.finish().unwrap();
    rt.finish().unwrap();
    assert!(rt.is_finished());
    assert_eq!(terminated.load(Ordering::SeqCst), 2);
    assert_eq!(first.state(), LibraryState::Terminated);
    assert_eq!(second.state(), LibraryState::Terminated);
    assert!(rt.libraries().is_empty());

    drop(rt);
    assert_eq!(terminated.load(Ordering::SeqCst), 2);
}

#[test]
fn test_drop_finishes_runtime() {
    let terminated = Arc::new(AtomicUsize::new(0));
    let rt = Runtime::new(RuntimeConfig::default());
    let lib = rt.load_library(counting_hook(
        library("res://dropped", &[("A", "Node")]),
        EntryPoint::Terminate,
        &terminated,
    ));
    rt.init_library(&lib).unwrap();

    drop(rt);
    assert_eq!(terminated.load(Ordering::SeqCst), 1);
    assert_eq!(lib.state(), LibraryState::Terminated);
}

#[test]
fn test_unload_forgets_library() {
    let rt = Runtime::new(RuntimeConfig::default());
    let lib = rt.load_library(library("res://unload", &[("A", "Node")]));
    rt.init_library(&lib).unwrap();

    rt.unload_library(&lib).unwrap();
    assert!(rt.library("res://unload").is_none());
    assert_eq!(lib.state(), LibraryState::Terminated);
    assert!(rt.find_class(lib.id(), "A").is_none());
}

#[test]
fn test_reload_of_never_initialized_library_inits() {
    let rt = Runtime::new(RuntimeConfig::default());
    let lib = rt.load_library(library("res://fresh", &[("A", "Node")]));

    let report = rt.reload_library(&lib).unwrap();
    assert_eq!(report, ReloadReport::default());
    assert!(lib.is_initialized());
}

#[test]
fn test_reload_swaps_classes() {
    let rt = Runtime::new(RuntimeConfig::default());
    let lib = rt.load_library(library("res://swap", &[("Old", "Node")]));
    rt.init_library(&lib).unwrap();

    rt.reload_library_with(&lib, library("res://swap", &[("New", "Node")]))
        .unwrap();
    assert!(lib.is_initialized());
    assert_eq!(rt.class_names(lib.id()), vec!["New".to_string()]);
    assert!(rt.find_descriptor(lib.id(), "Old").is_none());
}

#[test]
fn test_reload_revives_terminated_library() {
    let rt = Runtime::new(RuntimeConfig::default());
    let lib = rt.load_library(EmbeddedLibrary::new("res://revive"));
    assert!(rt.init_library(&lib).is_err());

    rt.reload_library_with(&lib, library("res://revive", &[("A", "Node")]))
        .unwrap();
    assert!(lib.is_initialized());
}

#[test]
fn test_unload_cancels_pending_init() {
    let rt = Runtime::new(RuntimeConfig::default());
    let lib = rt.load_library(library("res://pending", &[("G", "Node")]));

    let status = {
        let rt = Arc::clone(&rt);
        let lib = Arc::clone(&lib);
        thread::spawn(move || rt.init_library(&lib).unwrap())
            .join()
            .unwrap()
    };
    assert_eq!(status, InitStatus::Deferred);
    assert!(rt.has_pending_work());

    rt.unload_library(&lib).unwrap();
    assert_eq!(lib.state(), LibraryState::Terminated);

    assert_eq!(rt.frame().unwrap(), 1);
    assert!(rt.library("res://pending").is_none());
    assert_eq!(lib.state(), LibraryState::Terminated);
    assert!(rt.class_names(lib.id()).is_empty());
    assert!(rt.find_class(lib.id(), "G").is_none());
    assert!(matches!(
        rt.reload_library(&lib),
        Err(ScriptError::LibraryNotLoaded { .. })
    ));
}

#[test]
fn test_unload_during_setup_publishes_nothing() {
    let terminated = Arc::new(AtomicUsize::new(0));
    let rt = Runtime::new(RuntimeConfig::default());
    let weak = Arc::downgrade(&rt);
    let lib = EmbeddedLibrary::new("res://vanishing").on_init(move |reg| {
        reg.register_class("A", "Node", None, destroy())
            .map_err(|e| e.to_string())?;
        if let Some(rt) = weak.upgrade() {
            if let Some(lib) = rt.library("res://vanishing") {
                rt.unload_library(&lib).map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    });
    let lib = rt.load_library(counting_hook(lib, EntryPoint::Terminate, &terminated));

    assert!(matches!(
        rt.init_library(&lib),
        Err(ScriptError::LibraryNotLoaded { .. })
    ));
    assert_eq!(lib.state(), LibraryState::Terminated);
    assert_eq!(terminated.load(Ordering::SeqCst), 1);
    assert!(rt.library("res://vanishing").is_none());
    assert!(rt.find_class(lib.id(), "A").is_none());
}

#[test]
fn test_init_refuses_library_of_another_runtime() {
    let rt = Runtime::new(RuntimeConfig::default());
    let other = Runtime::new(RuntimeConfig::default());
    let lib = other.load_library(library("res://elsewhere", &[("A", "Node")]));

    assert!(matches!(
        rt.init_library(&lib),
        Err(ScriptError::LibraryNotLoaded { .. })
    ));
    assert_eq!(lib.state(), LibraryState::Loading);
    assert!(rt.library("res://elsewhere").is_none());
}

thread_local! {
    static CREATE_ON_DESTROY: RefCell<Option<Arc<Script>>> = const { RefCell::new(None) };
    static CREATED_ON_DESTROY: RefCell<Option<ScriptResult<Arc<ScriptInstance>>>> =
        const { RefCell::new(None) };
}

unsafe extern "C" fn unit_create(_: ObjectId, _: *mut c_void) -> *mut c_void {
    Box::into_raw(Box::new(0u8)) as *mut c_void
}

/// Frees the user-data; when armed, instantiates the script once more from
/// inside the destructor, the way a worker racing a reload would
unsafe extern "C" fn unit_destroy(_: ObjectId, _: *mut c_void, user_data: *mut c_void) {
    drop(Box::from_raw(user_data as *mut u8));
    if let Some(script) = CREATE_ON_DESTROY.with(|cell| cell.borrow_mut().take()) {
        let result = script.create_instance(ObjectId(2));
        CREATED_ON_DESTROY.with(|cell| *cell.borrow_mut() = Some(result));
    }
}

unsafe extern "C" fn unit_version(
    _: ObjectId,
    method_data: *mut c_void,
    _: *mut c_void,
    _: usize,
    _: *const Variant,
    ret: *mut Variant,
) -> CallStatus {
    *ret = Variant::Int(method_data as usize as i64);
    CallStatus::Ok
}

/// `Unit` whose `ver` method answers `version`
fn versioned_unit(version: usize) -> EmbeddedLibrary {
    EmbeddedLibrary::new("res://versioned").on_init(move |reg| {
        reg.register_class(
            "Unit",
            "Reference",
            Some(NativeCallback::new(unit_create as CreateFn)),
            NativeCallback::new(unit_destroy as DestroyFn),
        )
        .map_err(|e| e.to_string())?;
        reg.register_method(
            "Unit",
            MethodInfo::new("ver"),
            RpcMode::Disabled,
            NativeCallback::with_data(unit_version as MethodFn, version as *mut c_void, None),
        )
        .map_err(|e| e.to_string())
    })
}

#[test]
fn test_reload_refreshes_instances_created_mid_reload() {
    let rt = Runtime::new(RuntimeConfig::default());
    let lib = rt.load_library(versioned_unit(1));
    let script = rt.create_script(&lib, "Unit");
    let first = script.create_instance(ObjectId(1)).unwrap();
    assert_eq!(first.call("ver", &[]).unwrap(), Variant::Int(1));

    CREATE_ON_DESTROY.with(|cell| *cell.borrow_mut() = Some(Arc::clone(&script)));
    let report = rt.reload_library_with(&lib, versioned_unit(2)).unwrap();
    assert_eq!(report.detached, 1);

    // the old classes were already hidden when the destructor ran
    let created = CREATED_ON_DESTROY.with(|cell| cell.borrow_mut().take());
    assert!(matches!(created, Some(Err(ScriptError::UnresolvedClass { .. }))));

    assert_eq!(first.call("ver", &[]).unwrap(), Variant::Int(2));
    let second = script.create_instance(ObjectId(2)).unwrap();
    assert_eq!(second.call("ver", &[]).unwrap(), Variant::Int(2));
}

#[test]
fn test_reattach_replaces_user_data_of_old_class() {
    let rt = Runtime::new(RuntimeConfig::default());
    let lib = rt.load_library(versioned_unit(1));
    let script = rt.create_script(&lib, "Unit");
    let instance = script.create_instance(ObjectId(1)).unwrap();
    let old = script.resolve_descriptor().unwrap();

    rt.reload_library_with(&lib, versioned_unit(2)).unwrap();
    assert_eq!(instance.call("ver", &[]).unwrap(), Variant::Int(2));

    // user-data still built from the previous class
    instance.reattach(old).unwrap();
    assert_eq!(instance.call("ver", &[]).unwrap(), Variant::Int(1));

    assert_eq!(script.reload_instances(), 1);
    assert_eq!(instance.call("ver", &[]).unwrap(), Variant::Int(2));

    // already current: nothing is rebuilt
    assert_eq!(script.reload_instances(), 1);
    assert_eq!(instance.call("ver", &[]).unwrap(), Variant::Int(2));
}
