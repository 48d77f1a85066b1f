//! Plugins shipped with the binary.

mod autocert;

pub use autocert::autocert;

use crate::hooks::Plugin;

/// Every built-in plugin, in registration order.
pub fn builtin() -> Vec<Plugin> {
    vec![autocert()]
}
