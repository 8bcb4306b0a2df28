//! Rendering surface and engine seams
//!
//! A surface is the single place output is shown (a browser pane, the local
//! tty). Attaching a virtual terminal mounts a fresh engine on the surface;
//! detaching drops it. The engine interprets escape sequences, the core never
//! does.

/// A terminal display engine mounted on a surface.
pub trait RenderEngine {
    /// Feed raw process output.
    fn write(&mut self, data: &[u8]);
    fn resize(&mut self, cols: u16, rows: u16);
    /// Current size as `(cols, rows)`.
    fn size(&self) -> (u16, u16);
}

/// The one rendering surface owned by a multiplexer.
pub trait RenderSurface {
    type Engine: RenderEngine;

    /// Create an engine of the given size on this surface.
    fn mount(&mut self, cols: u16, rows: u16) -> Self::Engine;

    /// Called after the mounted engine has been released.
    fn unmount(&mut self) {}

    /// Geometry the surface can currently display, as `(cols, rows)`.
    /// `None` when it is not measurable (hidden, zero-sized).
    fn fit(&self) -> Option<(u16, u16)>;
}

/// In-memory surface backed by the `vt100` parser.
#[derive(Debug, Default)]
pub struct Vt100Surface {
    geometry: Option<(u16, u16)>,
    mounts: usize,
    unmounts: usize,
}

impl Vt100Surface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_geometry(cols: u16, rows: u16) -> Self {
        Self {
            geometry: Some((cols, rows)),
            ..Self::default()
        }
    }

    /// Simulate the surface changing size (window resize).
    pub fn set_geometry(&mut self, geometry: Option<(u16, u16)>) {
        self.geometry = geometry;
    }

    /// Number of engines ever mounted.
    pub fn mount_count(&self) -> usize {
        self.mounts
    }

    /// True while an engine is mounted.
    pub fn is_mounted(&self) -> bool {
        self.mounts > self.unmounts
    }
}

impl RenderSurface for Vt100Surface {
    type Engine = Vt100Engine;

    fn mount(&mut self, cols: u16, rows: u16) -> Vt100Engine {
        self.mounts += 1;
        Vt100Engine::new(cols, rows)
    }

    fn unmount(&mut self) {
        self.unmounts += 1;
    }

    fn fit(&self) -> Option<(u16, u16)> {
        self.geometry
    }
}

/// A `vt100` screen.
pub struct Vt100Engine {
    parser: vt100::Parser,
}

impl Vt100Engine {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            parser: vt100::Parser::new(rows, cols, 0),
        }
    }

    /// Visible screen text.
    pub fn contents(&self) -> String {
        self.parser.screen().contents()
    }

    pub fn screen(&self) -> &vt100::Screen {
        self.parser.screen()
    }
}

impl RenderEngine for Vt100Engine {
    fn write(&mut self, data: &[u8]) {
        self.parser.process(data);
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.parser.screen_mut().set_size(rows, cols);
    }

    fn size(&self) -> (u16, u16) {
        let (rows, cols) = self.parser.screen().size();
        (cols, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_renders_text() {
        let mut engine = Vt100Engine::new(20, 3);
        engine.write(b"hello\r\nworld");
        let contents = engine.contents();
        assert!(contents.contains("hello"));
        assert!(contents.contains("world"));
    }

    #[test]
    fn engine_size_is_cols_rows() {
        let mut engine = Vt100Engine::new(80, 24);
        assert_eq!(engine.size(), (80, 24));
        engine.resize(120, 40);
        assert_eq!(engine.size(), (120, 40));
    }

    #[test]
    fn surface_tracks_mounts() {
        let mut surface = Vt100Surface::with_geometry(100, 30);
        assert!(!surface.is_mounted());
        let engine = surface.mount(100, 30);
        assert!(surface.is_mounted());
        drop(engine);
        surface.unmount();
        assert!(!surface.is_mounted());
        assert_eq!(surface.mount_count(), 1);
        assert_eq!(surface.fit(), Some((100, 30)));
    }
}
