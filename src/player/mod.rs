//! Motor de reproducción: una sesión por guild, con su cola, su render
//! y sus tareas de fondo, todo detrás del registro.

pub mod announce;
pub mod queue;
pub mod registry;
pub mod render;
pub mod session;

pub use queue::LoopMode;
pub use registry::SessionRegistry;
pub use session::{PlaybackSession, SessionConfig};
