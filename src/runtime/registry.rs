//! Boxed values and the process-global object registry
//!
//! Every value that crosses the runtime boundary is an opaque pointer to a
//! `Boxed` owned by the registry. The registry keeps everything alive for
//! the duration of the session, so emitted code can hold raw pointers
//! without a collector. Symbols are interned: the same name always yields
//! the same pointer.
//!
//! All entry points use the C calling convention and raw pointers; they
//! are handed to the runtime stub as a function-pointer table.

use rustc_hash::FxHashMap;
use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::{Mutex, OnceLock};

/// A heap value behind the runtime boundary.
#[derive(Debug)]
pub enum Boxed {
    Int(i64),
    Float(f64),
    Symbol(String),
    Dict(FxHashMap<DictKey, *mut Boxed>),
}

/// Structural key for dictionary lookups. Boxed integers and floats key by
/// value, symbols by interned name, dictionaries by identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DictKey {
    Int(i64),
    FloatBits(u64),
    Symbol(String),
    Identity(usize),
}

impl DictKey {
    fn of(value: *mut Boxed) -> Option<DictKey> {
        if value.is_null() {
            return None;
        }
        // Safety: every non-null pointer crossing the boundary came out of
        // this registry and stays alive until session teardown.
        match unsafe { &*value } {
            Boxed::Int(v) => Some(DictKey::Int(*v)),
            Boxed::Float(v) => Some(DictKey::FloatBits(v.to_bits())),
            Boxed::Symbol(name) => Some(DictKey::Symbol(name.clone())),
            Boxed::Dict(_) => Some(DictKey::Identity(value as usize)),
        }
    }
}

struct Registry {
    /// Every allocation, in creation order. Ownership lives here.
    live: Vec<*mut Boxed>,
    /// Interned symbols by name.
    symbols: FxHashMap<String, *mut Boxed>,
}

// Safety: the registry is only reached through the mutex below, and the
// raw pointers it owns are never freed while the process-global runtime
// is alive.
unsafe impl Send for Registry {}

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();

fn registry() -> &'static Mutex<Registry> {
    REGISTRY.get_or_init(|| {
        Mutex::new(Registry {
            live: Vec::new(),
            symbols: FxHashMap::default(),
        })
    })
}

fn alloc(value: Boxed) -> *mut Boxed {
    let ptr = Box::into_raw(Box::new(value));
    let mut reg = registry().lock().unwrap_or_else(|e| e.into_inner());
    reg.live.push(ptr);
    ptr
}

/// Number of live boxed values. Test hook.
pub fn live_count() -> usize {
    registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .live
        .len()
}

pub extern "C" fn rt_dict_new() -> *mut Boxed {
    alloc(Boxed::Dict(FxHashMap::default()))
}

pub extern "C" fn rt_dict_get(dict: *mut Boxed, key: *mut Boxed) -> *mut Boxed {
    if dict.is_null() {
        eprintln!("nbjit runtime: dict_get on null dictionary");
        return std::ptr::null_mut();
    }
    let Some(key) = DictKey::of(key) else {
        eprintln!("nbjit runtime: dict_get with null key");
        return std::ptr::null_mut();
    };
    // Safety: see DictKey::of.
    match unsafe { &*dict } {
        Boxed::Dict(map) => map.get(&key).copied().unwrap_or(std::ptr::null_mut()),
        other => {
            eprintln!("nbjit runtime: dict_get on non-dictionary {:?}", other);
            std::ptr::null_mut()
        }
    }
}

/// Argument order matches the original runtime: value before key.
pub extern "C" fn rt_dict_set(dict: *mut Boxed, value: *mut Boxed, key: *mut Boxed) {
    if dict.is_null() {
        eprintln!("nbjit runtime: dict_set on null dictionary");
        return;
    }
    let Some(key) = DictKey::of(key) else {
        eprintln!("nbjit runtime: dict_set with null key");
        return;
    };
    // Safety: see DictKey::of. The registry owns the allocation; no other
    // reference is live during a runtime call (single-threaded sessions).
    match unsafe { &mut *dict } {
        Boxed::Dict(map) => {
            map.insert(key, value);
        }
        other => {
            eprintln!("nbjit runtime: dict_set on non-dictionary {:?}", other);
        }
    }
}

pub extern "C" fn rt_symbol_from_cstr(s: *const c_char) -> *mut Boxed {
    if s.is_null() {
        eprintln!("nbjit runtime: symbol_from_cstr with null string");
        return std::ptr::null_mut();
    }
    // Safety: emitted code passes pointers to null-terminated constants it
    // owns in its own data section.
    let name = unsafe { CStr::from_ptr(s) }.to_string_lossy().into_owned();
    {
        let reg = registry().lock().unwrap_or_else(|e| e.into_inner());
        if let Some(&ptr) = reg.symbols.get(&name) {
            return ptr;
        }
    }
    let ptr = alloc(Boxed::Symbol(name.clone()));
    let mut reg = registry().lock().unwrap_or_else(|e| e.into_inner());
    reg.symbols.insert(name, ptr);
    ptr
}

pub extern "C" fn rt_box_int(v: i64) -> *mut Boxed {
    alloc(Boxed::Int(v))
}

pub extern "C" fn rt_box_float(v: f64) -> *mut Boxed {
    alloc(Boxed::Float(v))
}

pub extern "C" fn rt_unbox_int(ptr: *mut Boxed) -> i64 {
    if ptr.is_null() {
        return 0;
    }
    // Safety: see DictKey::of.
    match unsafe { &*ptr } {
        Boxed::Int(v) => *v,
        Boxed::Float(v) => *v as i64,
        other => {
            eprintln!("nbjit runtime: unbox_int on {:?}", other);
            0
        }
    }
}

pub extern "C" fn rt_unbox_float(ptr: *mut Boxed) -> f64 {
    if ptr.is_null() {
        return 0.0;
    }
    // Safety: see DictKey::of.
    match unsafe { &*ptr } {
        Boxed::Float(v) => *v,
        Boxed::Int(v) => *v as f64,
        other => {
            eprintln!("nbjit runtime: unbox_float on {:?}", other);
            0.0
        }
    }
}
