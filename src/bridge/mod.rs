//! Value bridge between native code and plugin scripts.
//!
//! The [`Bridge`] is built once at startup and shared by every plugin
//! worker. It owns:
//!
//! - the [`HandleTable`] of native objects scripts may reference;
//! - the [`ConverterRegistry`] with one converter per native class;
//! - enum constant sets and static tables installed identically into
//!   every Lua state.
//!
//! All conversions go through [`Bridge::to_script`] and
//! [`Bridge::to_native`].

pub mod convert;
pub mod expose;
pub mod handle;
pub mod value;

use std::sync::Arc;

use mlua::prelude::*;

pub use convert::{ConverterRegistry, TypeTag};
pub use expose::{EnumSet, Native, NativeClass, StaticTable};
pub use handle::{HandleId, HandleRef, HandleTable};
pub use value::Value;

use crate::error::{Error, Result};

/// Nesting limit for sequences crossing the boundary.
const MAX_DEPTH: usize = 32;

/// Shared conversion and exposition state.
#[derive(Debug, Default)]
pub struct Bridge {
    handles: Arc<HandleTable>,
    classes: ConverterRegistry,
    enums: Vec<EnumSet>,
    tables: Vec<StaticTable>,
}

impl Bridge {
    /// Create a bridge with an empty handle table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared handle table.
    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.handles
    }

    /// Register a native class. Registering twice is a no-op.
    pub fn register_class<T: NativeClass>(&mut self) {
        if !self.classes.register::<T>() {
            log::debug!("Class {} already registered", T::NAME);
        }
    }

    /// Add an enum constant set.
    pub fn register_enum(&mut self, set: EnumSet) {
        self.enums.push(set);
    }

    /// Add a static table.
    pub fn register_table(&mut self, table: StaticTable) {
        self.tables.push(table);
    }

    /// Names of registered classes.
    pub fn class_names(&self) -> Vec<&'static str> {
        self.classes.class_names()
    }

    /// Expose a native object and return its handle id.
    pub fn expose<T: NativeClass>(&self, object: Arc<T>) -> HandleId {
        self.handles.insert(TypeTag::of::<T>(), object)
    }

    /// Install enums and static tables into `lua`'s globals.
    ///
    /// Namespace tables are created on demand, or extended if a primitive
    /// already created them. The bridge itself is kept in the state's app
    /// data so native methods can convert their arguments, see
    /// [`Bridge::of`].
    pub fn install(self: &Arc<Self>, lua: &Lua) -> LuaResult<()> {
        for set in &self.enums {
            let table = lua.create_table()?;
            for (name, value) in &set.constants {
                table.set(*name, *value)?;
            }
            namespace(lua, set.namespace)?.set(set.name, table)?;
        }

        for spec in &self.tables {
            let table = lua.create_table()?;
            for (key, value) in &spec.entries {
                table.set(key.as_str(), self.to_script(lua, value)?)?;
            }
            namespace(lua, spec.namespace)?.set(spec.name, table)?;
        }

        lua.set_app_data(Arc::clone(self));
        Ok(())
    }

    /// The bridge installed into `lua`.
    pub fn of(lua: &Lua) -> Result<Arc<Bridge>> {
        lua.app_data_ref::<Arc<Bridge>>()
            .map(|bridge| Arc::clone(&bridge))
            .ok_or_else(|| Error::BridgeConversion("no bridge installed in this state".into()))
    }

    /// Convert a [`Value`] into a Lua value.
    ///
    /// Handles become userdata of their registered class; revoked handles
    /// fail with `HandleExpired`.
    pub fn to_script(&self, lua: &Lua, value: &Value) -> LuaResult<LuaValue> {
        self.to_script_depth(lua, value, 0)
    }

    fn to_script_depth(&self, lua: &Lua, value: &Value, depth: usize) -> LuaResult<LuaValue> {
        if depth > MAX_DEPTH {
            return Err(Error::BridgeConversion("sequence nested too deeply".into()).into());
        }
        Ok(match value {
            Value::Nil => LuaValue::Nil,
            Value::Bool(b) => LuaValue::Boolean(*b),
            Value::Int(i) => LuaValue::Integer(*i),
            Value::Double(d) => LuaValue::Number(*d),
            Value::Text(s) => {
                Value::check_text(s)?;
                LuaValue::String(lua.create_string(s)?)
            }
            Value::Sequence(items) => {
                let table = lua.create_table_with_capacity(items.len(), 0)?;
                for (i, item) in items.iter().enumerate() {
                    table.raw_set(i + 1, self.to_script_depth(lua, item, depth + 1)?)?;
                }
                LuaValue::Table(table)
            }
            Value::Handle(id) => {
                let tag = self.handles.tag(*id)?;
                let handle = HandleRef::new(&self.handles, *id)?;
                LuaValue::UserData(self.classes.to_script(lua, tag, handle)?)
            }
        })
    }

    /// Convert a Lua value into a [`Value`].
    ///
    /// Functions, threads and non-sequence tables have no representation
    /// and fail with `BridgeConversion`.
    pub fn to_native(&self, value: &LuaValue) -> Result<Value> {
        self.to_native_depth(value, 0)
    }

    fn to_native_depth(&self, value: &LuaValue, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(Error::BridgeConversion("table nested too deeply".into()));
        }
        match value {
            LuaValue::Nil => Ok(Value::Nil),
            LuaValue::Boolean(b) => Ok(Value::Bool(*b)),
            LuaValue::Integer(i) => Ok(Value::Int(*i)),
            LuaValue::Number(n) => Ok(Value::Double(*n)),
            LuaValue::String(s) => Value::text_from_bytes(&s.as_bytes()).map(Value::Text),
            LuaValue::Table(table) => self.sequence_from_table(table, depth),
            LuaValue::UserData(ud) => self.classes.to_native(ud).map(Value::Handle),
            other => Err(Error::BridgeConversion(format!(
                "cannot convert a Lua {}",
                other.type_name()
            ))),
        }
    }

    fn sequence_from_table(&self, table: &LuaTable, depth: usize) -> Result<Value> {
        let conversion = |e: LuaError| Error::BridgeConversion(e.to_string());

        let len = table.raw_len();
        let pairs = table.clone().pairs::<LuaValue, LuaValue>().count();
        if pairs != len {
            return Err(Error::BridgeConversion(
                "table is not a sequence".into(),
            ));
        }

        let mut items = Vec::with_capacity(len);
        for i in 1..=len {
            let item: LuaValue = table.raw_get(i).map_err(conversion)?;
            items.push(self.to_native_depth(&item, depth + 1)?);
        }
        Ok(Value::Sequence(items))
    }
}

/// Get or create the global table `name`.
fn namespace(lua: &Lua, name: &str) -> LuaResult<LuaTable> {
    let globals = lua.globals();
    match globals.get::<Option<LuaTable>>(name)? {
        Some(table) => Ok(table),
        None => {
            let table = lua.create_table()?;
            globals.set(name, table.clone())?;
            Ok(table)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct Widget {
        label: String,
    }

    impl NativeClass for Widget {
        const NAME: &'static str = "Widget";

        fn add_methods<M: LuaUserDataMethods<Native<Self>>>(methods: &mut M) {
            methods.add_method("label", |_, this, ()| Ok(this.get()?.label.clone()));
        }

        fn describe(&self) -> String {
            format!("Widget({})", self.label)
        }
    }

    fn bridge() -> Bridge {
        let mut bridge = Bridge::new();
        bridge.register_class::<Widget>();
        bridge
    }

    fn round_trip(bridge: &Bridge, lua: &Lua, value: &Value) -> Value {
        let script = bridge.to_script(lua, value).expect("Should convert to script");
        bridge.to_native(&script).expect("Should convert to native")
    }

    proptest! {
        #[test]
        fn test_scalar_bool_round_trip(b in any::<bool>()) {
            let (bridge, lua) = (Bridge::new(), Lua::new());
            prop_assert_eq!(round_trip(&bridge, &lua, &Value::Bool(b)), Value::Bool(b));
        }

        #[test]
        fn test_scalar_int_round_trip(i in any::<i64>()) {
            let (bridge, lua) = (Bridge::new(), Lua::new());
            prop_assert_eq!(round_trip(&bridge, &lua, &Value::Int(i)), Value::Int(i));
        }

        #[test]
        fn test_scalar_double_round_trip(d in any::<f64>().prop_filter("NaN never equals itself", |d| !d.is_nan())) {
            let (bridge, lua) = (Bridge::new(), Lua::new());
            prop_assert_eq!(round_trip(&bridge, &lua, &Value::Double(d)), Value::Double(d));
        }

        #[test]
        fn test_scalar_text_round_trip(s in r"[^\x00]*") {
            let (bridge, lua) = (Bridge::new(), Lua::new());
            prop_assert_eq!(round_trip(&bridge, &lua, &Value::Text(s.clone())), Value::Text(s));
        }
    }

    #[test]
    fn test_sequence_round_trip() {
        let (bridge, lua) = (Bridge::new(), Lua::new());
        let value = Value::Sequence(vec![
            Value::Text("a".into()),
            Value::Int(2),
            Value::Sequence(vec![Value::Bool(false)]),
        ]);
        assert_eq!(round_trip(&bridge, &lua, &value), value);
    }

    #[test]
    fn test_double_stays_double() {
        let (bridge, lua) = (Bridge::new(), Lua::new());
        assert_eq!(
            round_trip(&bridge, &lua, &Value::Double(2.0)),
            Value::Double(2.0)
        );
    }

    #[test]
    fn test_text_with_nul_rejected_both_ways() {
        let (bridge, lua) = (Bridge::new(), Lua::new());
        assert!(bridge
            .to_script(&lua, &Value::Text("a\0b".into()))
            .is_err());

        let s: LuaValue = lua.load(r#"return "a\0b""#).eval().unwrap();
        assert!(matches!(
            bridge.to_native(&s),
            Err(Error::BridgeConversion(_))
        ));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let (bridge, lua) = (Bridge::new(), Lua::new());
        let s: LuaValue = lua.load(r#"return "\xff\xfe""#).eval().unwrap();
        assert!(matches!(
            bridge.to_native(&s),
            Err(Error::BridgeConversion(_))
        ));
    }

    #[test]
    fn test_unsupported_lua_types_rejected() {
        let (bridge, lua) = (Bridge::new(), Lua::new());
        let f: LuaValue = lua.load("return function() end").eval().unwrap();
        assert!(bridge.to_native(&f).is_err());

        let map: LuaValue = lua.load("return { a = 1 }").eval().unwrap();
        assert!(bridge.to_native(&map).is_err());
    }

    #[test]
    fn test_handle_identity_preserved() {
        let bridge = bridge();
        let lua = Lua::new();
        let id = bridge.expose(Arc::new(Widget {
            label: "w".into(),
        }));
        assert_eq!(
            round_trip(&bridge, &lua, &Value::Handle(id)),
            Value::Handle(id)
        );
    }

    #[test]
    fn test_handle_methods_and_metamethods() {
        let bridge = bridge();
        let lua = Lua::new();
        let id = bridge.expose(Arc::new(Widget {
            label: "knob".into(),
        }));

        let a = bridge.to_script(&lua, &Value::Handle(id)).unwrap();
        let b = bridge.to_script(&lua, &Value::Handle(id)).unwrap();
        lua.globals().set("a", a).unwrap();
        lua.globals().set("b", b).unwrap();

        let label: String = lua.load("return a:label()").eval().unwrap();
        assert_eq!(label, "knob");
        let text: String = lua.load("return tostring(a)").eval().unwrap();
        assert_eq!(text, "Widget(knob)");
        let same: bool = lua.load("return a == b").eval().unwrap();
        assert!(same);
        assert_eq!(bridge.handles().script_refs(id), 2);
    }

    #[test]
    fn test_revoked_handle_fails_in_script() {
        let bridge = bridge();
        let lua = Lua::new();
        let id = bridge.expose(Arc::new(Widget {
            label: "gone".into(),
        }));
        let ud = bridge.to_script(&lua, &Value::Handle(id)).unwrap();
        lua.globals().set("w", ud).unwrap();

        bridge.handles().revoke(id);

        let err = lua.load("return w:label()").eval::<String>().unwrap_err();
        assert!(err.to_string().contains("has expired"));
        let text: String = lua.load("return tostring(w)").eval().unwrap();
        assert_eq!(text, "Widget (expired)");

        assert!(bridge.to_script(&lua, &Value::Handle(id)).is_err());
    }

    #[test]
    fn test_collected_userdata_releases_reference() {
        let bridge = bridge();
        let lua = Lua::new();
        let id = bridge.expose(Arc::new(Widget {
            label: "tmp".into(),
        }));
        {
            let ud = bridge.to_script(&lua, &Value::Handle(id)).unwrap();
            drop(ud);
        }
        lua.gc_collect().unwrap();
        lua.gc_collect().unwrap();
        assert_eq!(bridge.handles().script_refs(id), 0);

        bridge.handles().revoke(id);
        assert_eq!(bridge.handles().sweep(), 1);
    }

    #[test]
    fn test_install_enums_and_tables() {
        let mut bridge = Bridge::new();
        bridge.register_enum(EnumSet {
            namespace: "irc",
            name: "state",
            constants: vec![("Disconnected", 0), ("Connected", 2)],
        });
        bridge.register_table(StaticTable {
            namespace: "irc",
            name: "limits",
            entries: vec![("line".into(), Value::Int(512))],
        });

        let lua = Lua::new();
        lua.globals().set("irc", lua.create_table().unwrap()).unwrap();
        lua.globals()
            .get::<LuaTable>("irc")
            .unwrap()
            .set("version", "x")
            .unwrap();
        let bridge = Arc::new(bridge);
        bridge.install(&lua).unwrap();
        assert!(Arc::ptr_eq(&Bridge::of(&lua).unwrap(), &bridge));

        let connected: i64 = lua.load("return irc.state.Connected").eval().unwrap();
        assert_eq!(connected, 2);
        let line: i64 = lua.load("return irc.limits.line").eval().unwrap();
        assert_eq!(line, 512);
        let version: String = lua.load("return irc.version").eval().unwrap();
        assert_eq!(version, "x", "existing namespace is extended, not replaced");
    }
}
