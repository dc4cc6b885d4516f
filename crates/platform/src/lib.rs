//! Platform layer for vkpipe.
//!
//! A winit window exposing raw display and window handles for Vulkan
//! surface creation.

mod window;

pub use window::Window;

// Re-export winit types the event loop needs
pub use winit::application::ApplicationHandler;
pub use winit::event::WindowEvent;
pub use winit::event_loop::{ActiveEventLoop, EventLoop};
pub use winit::window::WindowId;
