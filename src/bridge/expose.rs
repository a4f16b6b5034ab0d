//! Uniform exposition of native classes, enums and static tables.
//!
//! A native class implements [`NativeClass`] once; every instance a script
//! sees is a [`Native<T>`] userdata built by the converter registry. Enum
//! constant sets and static tables are plain descriptions that
//! [`Bridge::install`](super::Bridge::install) turns into Lua tables.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use mlua::prelude::*;

use super::handle::{HandleId, HandleRef};
use super::value::Value;

/// A native type that scripts can hold handles to.
pub trait NativeClass: Any + Send + Sync + Sized {
    /// Class name shown by `tostring`.
    const NAME: &'static str;

    /// Register the script-visible methods.
    ///
    /// Methods receive the [`Native`] wrapper and call [`Native::get`] to
    /// reach the object, which fails once the handle is revoked.
    fn add_methods<M: LuaUserDataMethods<Native<Self>>>(methods: &mut M);

    /// Text returned by `tostring` while the object is alive.
    fn describe(&self) -> String {
        Self::NAME.to_string()
    }
}

/// Script-side wrapper around a handle of class `T`.
pub struct Native<T> {
    handle: HandleRef,
    _class: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for Native<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Native").field("id", &self.handle.id()).finish()
    }
}

impl<T: NativeClass> Native<T> {
    /// Wrap a counted reference.
    pub fn new(handle: HandleRef) -> Self {
        Self {
            handle,
            _class: PhantomData,
        }
    }

    /// The handle id.
    pub fn id(&self) -> HandleId {
        self.handle.id()
    }

    /// Resolve the native object, failing with `HandleExpired` once revoked.
    pub fn get(&self) -> LuaResult<Arc<T>> {
        self.resolve().map_err(LuaError::from)
    }

    /// Like [`Native::get`] but keeps the typed error.
    pub fn resolve(&self) -> crate::error::Result<Arc<T>> {
        self.handle.resolve::<T>()
    }
}

impl<T: NativeClass> LuaUserData for Native<T> {
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(LuaMetaMethod::ToString, |_, this, ()| {
            Ok(match this.get() {
                Ok(object) => object.describe(),
                Err(_) => format!("{} (expired)", T::NAME),
            })
        });

        methods.add_meta_method(LuaMetaMethod::Eq, |_, this, other: LuaAnyUserData| {
            Ok(other
                .borrow::<Native<T>>()
                .is_ok_and(|other| other.id() == this.id()))
        });

        T::add_methods(methods);
    }
}

/// A named set of integer constants, e.g. `irc.state`.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumSet {
    /// Global table the enum is placed in.
    pub namespace: &'static str,
    /// Field name inside the namespace.
    pub name: &'static str,
    /// Constant names and values.
    pub constants: Vec<(&'static str, i64)>,
}

/// A named read-mostly table of values, e.g. `irc.limits`.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticTable {
    /// Global table the table is placed in.
    pub namespace: &'static str,
    /// Field name inside the namespace.
    pub name: &'static str,
    /// Keys and values.
    pub entries: Vec<(String, Value)>,
}
