//! Framebuffer output: device mapping, the accumulated image, the render
//! loop and raw still images.

pub mod canvas;
pub mod device;
pub mod renderer;
pub mod screenshot;
pub mod stills;

pub use canvas::{Canvas, CoordinateMapper, Plot};
pub use device::{DeviceError, DeviceGeometry, FramebufferDevice, PixelLayout};
pub use renderer::{PendingActions, RenderConfig, Renderer, TickReport};
