//! audio - the pluggable device bridge consumed by the voice engine.
//!
//! Replaces the platform audio stack with host-thread drivers so the example
//! devices run on a plain Linux box: dedicated render/capture threads paced
//! at the negotiated buffer cadence, with the capability contract, callback
//! taps, and mix graph layered on top.

pub mod device;
mod driver;
pub mod format;
mod graph_device;
mod source;
mod system_device;

pub use device::{AudioDevice, CaptureContext, DeviceError, RenderContext};
pub use driver::active_format;
pub use format::AudioFormat;
pub use graph_device::GraphAudioDevice;
pub use source::{RingbackTone, SampleSource};
pub use system_device::{OutputRoute, SystemAudioDevice};
