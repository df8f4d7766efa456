//! Polling window system built on winit's pump-events extension.
//!
//! winit normally owns the main loop through `run_app`. The frame engine
//! drives its own loop instead, so this module pumps the winit event queue on
//! demand and exposes it through [`EventSource`].

use std::time::Duration;

use ash::vk;
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::WindowId;

use swapframe_core::{Error, Result, WindowConfig};

use crate::events::EventSource;
use crate::window::Window;

/// Handler state fed by winit while events are pumped.
struct WindowState {
    config: WindowConfig,
    window: Option<Window>,
    window_created: bool,
    creation_error: Option<Error>,
    close_requested: bool,
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window_created {
            return;
        }

        match Window::new(event_loop, &self.config) {
            Ok(window) => {
                self.window = Some(window);
                self.window_created = true;
            }
            Err(e) => {
                tracing::error!("Failed to create window: {}", e);
                self.creation_error = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                tracing::info!("Close requested");
                self.close_requested = true;
            }
            WindowEvent::Resized(size) => {
                tracing::debug!("Window resized to {}x{}", size.width, size.height);
            }
            _ => {}
        }
    }
}

/// Owns the winit event loop and the single application window.
///
/// The windowing subsystem lives exactly as long as this value: creating it
/// opens the window, dropping it closes the window and releases the event
/// loop. There is no process-wide bookkeeping.
pub struct WindowSystem {
    event_loop: EventLoop<()>,
    state: WindowState,
    window: Window,
}

impl WindowSystem {
    /// Creates the event loop and pumps it until the window exists.
    ///
    /// # Errors
    /// Returns an error if the event loop cannot be created, window creation
    /// fails, or the platform exits before a window was produced.
    pub fn new(config: &WindowConfig) -> Result<Self> {
        let mut event_loop = EventLoop::new().map_err(|e| Error::Window(e.to_string()))?;
        event_loop.set_control_flow(ControlFlow::Poll);

        let mut state = WindowState {
            config: config.clone(),
            window: None,
            window_created: false,
            creation_error: None,
            close_requested: false,
        };

        let window = loop {
            let status = event_loop.pump_app_events(Some(Duration::ZERO), &mut state);

            if let Some(e) = state.creation_error.take() {
                return Err(e);
            }
            if let Some(window) = state.window.take() {
                break window;
            }
            if let PumpStatus::Exit(code) = status {
                return Err(Error::Window(format!(
                    "Event loop exited with code {} before a window was created",
                    code
                )));
            }
        };

        Ok(Self {
            event_loop,
            state,
            window,
        })
    }

    /// The application window.
    pub fn window(&self) -> &Window {
        &self.window
    }

    /// Current drawable size of the window in physical pixels.
    pub fn drawable_size(&self) -> vk::Extent2D {
        self.window.drawable_size()
    }

    fn pump(&mut self, timeout: Option<Duration>) {
        if let PumpStatus::Exit(code) = self.event_loop.pump_app_events(timeout, &mut self.state) {
            tracing::info!("Event loop exited with code {}", code);
            self.state.close_requested = true;
        }
    }
}

impl EventSource for WindowSystem {
    fn poll_events(&mut self) {
        self.pump(Some(Duration::ZERO));
    }

    fn wait_events(&mut self) {
        self.event_loop.set_control_flow(ControlFlow::Wait);
        self.pump(None);
        self.event_loop.set_control_flow(ControlFlow::Poll);
    }

    fn close_requested(&self) -> bool {
        self.state.close_requested
    }
}
