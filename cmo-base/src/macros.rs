//! Macros shared by CMO agents.

/// Export this so they don't need to import paste.
#[doc(hidden)]
pub use paste;
use serde::Deserialize;

#[macro_export]
/// Declare a new settings block for an agent.
///
/// The declared struct flattens [`crate::Settings`] and adds any
/// agent-specific fields. Integers must be specified as `String` so they can
/// be configured via env var, and parsed in the agent's `from_settings`.
///
/// ### Usage
///
/// ```ignore
/// decl_settings!(Orchestrator {
///     tenant: String,
///     project: String,
/// });
/// ```
macro_rules! decl_settings {
    (
        $name:ident {
            $($(#[$tags:meta])* $prop:ident: $type:ty,)*
        }
    ) => {
        cmo_base::macros::paste::paste! {
            #[derive(Debug, serde::Deserialize)]
            #[doc = "Settings for `" $name "`"]
            pub struct [<$name Settings>] {
                #[serde(flatten)]
                pub(crate) base: cmo_base::Settings,
                $(
                    $(#[$tags])*
                    pub(crate) $prop: $type,
                )*
            }

            impl std::ops::Deref for [<$name Settings>] {
                type Target = cmo_base::Settings;

                fn deref(&self) -> &Self::Target {
                    &self.base
                }
            }

            impl AsRef<cmo_base::Settings> for [<$name Settings>] {
                fn as_ref(&self) -> &cmo_base::Settings {
                    &self.base
                }
            }

            impl cmo_base::NewFromSettings for [<$name Settings>] {
                type Error = eyre::Report;

                /// See `load_settings_object` for how settings are loaded.
                fn new() -> Result<Self, Self::Error> {
                    cmo_base::macros::_new_settings(stringify!($name))
                }
            }
        }
    }
}

/// Static logic called by the decl_settings! macro. Do not call directly!
pub fn _new_settings<'de, T: Deserialize<'de>>(name: &str) -> eyre::Result<T> {
    crate::settings::load_settings_object(name)
}
