//! Converter registry keyed by type tag.
//!
//! Every native class exposed to scripts registers exactly one [`Converter`].
//! Handles of that class are turned into userdata (and back) through it,
//! so no call site builds userdata on its own.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use mlua::prelude::*;

use super::expose::{Native, NativeClass};
use super::handle::{HandleId, HandleRef};
use crate::error::{Error, Result};

/// Identity of a native class.
///
/// Equality and hashing use the Rust type id; the name is for messages and
/// `tostring`.
#[derive(Debug, Clone, Copy)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    /// Tag of a registered native class.
    pub fn of<T: NativeClass>() -> Self {
        Self::named::<T>(T::NAME)
    }

    /// Tag for any type under an explicit name.
    pub fn named<T: Any>(name: &'static str) -> Self {
        Self {
            id: TypeId::of::<T>(),
            name,
        }
    }

    /// Script-visible class name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeTag {}

impl Hash for TypeTag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

type ToScript = Box<dyn Fn(&Lua, HandleRef) -> LuaResult<LuaAnyUserData> + Send + Sync>;
type ToNative = Box<dyn Fn(&LuaAnyUserData) -> Option<HandleId> + Send + Sync>;

/// Conversion rules for one native class.
pub struct Converter {
    name: &'static str,
    to_script: ToScript,
    to_native: ToNative,
}

impl std::fmt::Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converter")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Converter {
    fn for_class<T: NativeClass>() -> Self {
        Self {
            name: T::NAME,
            to_script: Box::new(|lua, handle| lua.create_userdata(Native::<T>::new(handle))),
            to_native: Box::new(|ud| ud.borrow::<Native<T>>().ok().map(|n| n.id())),
        }
    }

    /// Class name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// All registered classes, keyed by tag.
#[derive(Debug, Default)]
pub struct ConverterRegistry {
    by_tag: HashMap<TypeTag, Converter>,
    order: Vec<TypeTag>,
}

impl ConverterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T`. Returns false if it was already registered.
    pub fn register<T: NativeClass>(&mut self) -> bool {
        let tag = TypeTag::of::<T>();
        if self.by_tag.contains_key(&tag) {
            return false;
        }
        self.by_tag.insert(tag, Converter::for_class::<T>());
        self.order.push(tag);
        true
    }

    /// Converter registered for `tag`.
    pub fn get(&self, tag: TypeTag) -> Option<&Converter> {
        self.by_tag.get(&tag)
    }

    /// Names of registered classes in registration order.
    pub fn class_names(&self) -> Vec<&'static str> {
        self.order.iter().map(TypeTag::name).collect()
    }

    /// Wrap a counted handle reference as script userdata.
    pub fn to_script(&self, lua: &Lua, tag: TypeTag, handle: HandleRef) -> Result<LuaAnyUserData> {
        let converter = self.by_tag.get(&tag).ok_or_else(|| {
            Error::BridgeConversion(format!("class {} is not registered", tag.name()))
        })?;
        (converter.to_script)(lua, handle).map_err(|e| Error::BridgeConversion(e.to_string()))
    }

    /// Recover the handle id from userdata created by [`Self::to_script`].
    pub fn to_native(&self, ud: &LuaAnyUserData) -> Result<HandleId> {
        self.order
            .iter()
            .filter_map(|tag| self.by_tag.get(tag))
            .find_map(|converter| (converter.to_native)(ud))
            .ok_or_else(|| Error::BridgeConversion("userdata is not a native handle".into()))
    }
}
