//! JSON-shaped value marshalling across the boundary
//!
//! Values that JSON cannot express (functions, `undefined`) come back as `null`;
//! keep a [`NativeReference`](tether_core::NativeReference) to them instead.

use crate::engine::caught;
use crate::ScriptError;
use rquickjs::{Ctx, Value};

pub fn to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<serde_json::Value, ScriptError> {
    let Some(text) = caught(ctx, ctx.json_stringify(value))? else {
        return Ok(serde_json::Value::Null);
    };
    let text = caught(ctx, text.to_string())?;
    Ok(serde_json::from_str(&text)?)
}

pub fn from_json<'js>(ctx: &Ctx<'js>, value: &serde_json::Value) -> Result<Value<'js>, ScriptError> {
    let text = serde_json::to_string(value)?;
    caught(ctx, ctx.json_parse(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    #[test]
    fn json_survives_a_trip_through_the_engine() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            let input = serde_json::json!({ "name": "widget", "sizes": [1, 2.5], "visible": true });
            let value = from_json(&ctx, &input).unwrap();
            assert_eq!(to_json(&ctx, value).unwrap(), input);
        });
    }

    #[test]
    fn functions_marshal_to_null() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            let value: Value = ctx.eval("(function () {})").unwrap();
            assert_eq!(to_json(&ctx, value).unwrap(), serde_json::Value::Null);
        });
    }
}
