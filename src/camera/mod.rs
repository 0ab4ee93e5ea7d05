//! Camera frames and template location.

mod locator;
mod matcher;
mod source;

pub use locator::{
    CameraError, CameraPosition, Frame, Located, Locator, SearchRequest, Template,
};
pub use matcher::{search_diameter_for, TemplateMatcher, DEFAULT_SEARCH_DIAMETER, SEARCH_MARGIN};
pub use source::{
    crop_centre_half, crop_template, generate_scene, Camera, SimulatedCamera, StillCamera,
    DEFAULT_HEIGHT, DEFAULT_WIDTH,
};
