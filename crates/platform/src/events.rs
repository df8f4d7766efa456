//! Event polling interface consumed by the frame loop.

/// Source of window-system events for a polling render loop.
///
/// The frame engine never sees individual events; it only needs to pump the
/// queue once per iteration, block while the surface is unusable, and learn
/// whether the user asked to close.
pub trait EventSource {
    /// Processes all pending events without blocking.
    fn poll_events(&mut self);

    /// Blocks until at least one event arrives, then processes it.
    ///
    /// Used while the surface has a zero extent (minimized window).
    fn wait_events(&mut self) {
        self.poll_events();
    }

    /// Returns true once a close was requested.
    fn close_requested(&self) -> bool;
}
