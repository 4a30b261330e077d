use std::env;
use std::str::FromStr;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use typed_builder::TypedBuilder;

pub mod node;
pub mod telemetry;

lazy_static::lazy_static! {
    pub static ref ENVIRONMENT: Mode = mode();
}

#[derive(
    Debug, Default, Display, Deserialize, Serialize, Clone, Copy, EnumString, AsRefStr, Eq, PartialEq,
)]
#[strum(serialize_all = "snake_case")]
pub enum Mode {
    #[default]
    Local,
    #[strum(serialize = "dev")]
    Development,
    Stage,
    #[strum(serialize = "prod")]
    Production,
}

fn mode() -> Mode {
    env::var("RUN_MODE")
        .map(|enum_str| Mode::from_str(enum_str.as_str()).unwrap_or_default())
        .unwrap_or_else(|_| Mode::Local)
}

#[derive(TypedBuilder)]
pub struct Settings<'a> {
    #[builder(default, setter(strip_option))]
    path: Option<&'a str>,
    #[builder(default = "MHE")]
    env_prefix: &'a str,
}

impl Settings<'_> {
    /// Loads a configuration value.
    ///
    /// Environment variables such as `MHE_SESSION__THRESHOLD` override the file at `path`, which
    /// is optional.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be built or deserialized.
    pub fn init_conf<'de, T: Deserialize<'de>>(&self) -> Result<T, ConfigError> {
        let mut s = Config::builder();

        if let Some(path) = self.path {
            s = s.add_source(File::with_name(path).required(false))
        };

        let s = s
            .add_source(
                Environment::with_prefix(self.env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }
}
