//! Visual servoing on a tracked template.

mod centre;

pub use centre::{
    centre_on_template, ServoConfig, ServoError, ServoRun, ServoStatus, DEFAULT_UM_PER_PIXEL,
};
