/// A template context "literal": a `serde_json::Map` from names to anything `Value` converts from.
macro_rules! context {
    ($($name:ident : $value:expr),* $(,)*) => {{
        let mut ctx = ::serde_json::Map::new();
        $(ctx.insert(stringify!($name).to_string(), ::serde_json::Value::from($value));)*
        ctx
    }};
}
