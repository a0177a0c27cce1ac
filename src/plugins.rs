//! External collaborators the decoder calls out to but never implements
//! itself (spec §6 "Consumed" list: native-function callbacks, field and
//! show plugins, external-call handlers). Visualization plugins that draw
//! pixels and packet capture I/O are out of scope entirely (spec
//! Non-goals); what remains here is the narrow set of hooks the Field
//! Decoder and DetailTree Builder need mid-walk.

use crate::lookup::SlotValue;

/// Result of a `plugin`-kind field decode (spec §3 field kind `plugin`).
#[derive(Debug, Clone)]
pub struct PluginFieldResult {
    pub consumed: usize,
    pub show_value: Option<String>,
}

/// A decoder for `field(kind: plugin, id: ...)` elements that this crate
/// cannot express as one of the sixteen built-in field kinds.
pub trait FieldPlugin {
    fn decode(&self, plugin_id: u32, available: &[u8]) -> Result<PluginFieldResult, String>;
}

/// A presentation routine for `visualize(plugin: ...)` templates (spec
/// §4.5 item "plugin"), distinct from the four native functions.
pub trait ShowPlugin {
    fn render(&self, plugin_id: u32, raw: &[u8]) -> Option<String>;
}

/// The four built-in presentation routines (spec §6 "Consumed:
/// Native-function callbacks"). A default implementation ships in
/// [`DefaultNativeFunctions`]; callers may substitute their own.
pub trait NativeFunctions {
    fn ipv4_dotted(&self, raw: &[u8]) -> Option<String>;
    fn ascii(&self, raw: &[u8]) -> Option<String>;
    fn ascii_line(&self, raw: &[u8]) -> Option<String>;
    fn http_content(&self, raw: &[u8]) -> Option<String>;
}

/// Straightforward implementation of the four native functions, in case
/// a caller has no reason to override them.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultNativeFunctions;

impl NativeFunctions for DefaultNativeFunctions {
    fn ipv4_dotted(&self, raw: &[u8]) -> Option<String> {
        if raw.len() != 4 {
            return None;
        }
        Some(format!("{}.{}.{}.{}", raw[0], raw[1], raw[2], raw[3]))
    }

    fn ascii(&self, raw: &[u8]) -> Option<String> {
        Some(String::from_utf8_lossy(raw).into_owned())
    }

    fn ascii_line(&self, raw: &[u8]) -> Option<String> {
        Some(String::from_utf8_lossy(raw).trim_end_matches(['\r', '\n']).to_string())
    }

    fn http_content(&self, raw: &[u8]) -> Option<String> {
        Some(String::from_utf8_lossy(raw).into_owned())
    }
}

/// Handler for `update-lookuptable`'s `external-call` attribute (spec
/// §4.2.4 "Lookup table actions"): some table updates are computed by
/// code outside the protocol DB entirely (e.g. a checksum database).
pub trait ExternalCallHandler {
    fn call(&mut self, module: &str, function: &str, keys: &[SlotValue]) -> Result<Vec<SlotValue>, String>;
}

/// An [`ExternalCallHandler`] that refuses every call; used where a
/// decoder configuration declares no external collaborators.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExternalCalls;

impl ExternalCallHandler for NoExternalCalls {
    fn call(&mut self, module: &str, function: &str, _keys: &[SlotValue]) -> Result<Vec<SlotValue>, String> {
        Err(format!("no external-call handler registered for {module}::{function}"))
    }
}
