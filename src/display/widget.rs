//! Widget tree primitives.
//!
//! A widget owns a rectangle, renders into a clipped canvas, and marks
//! itself dirty through a [`Dirty`] handle that any thread may hold (store
//! observers mark widgets dirty from the mutator's thread; the render task
//! wakes on the shared notifier).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Notify;

use super::framebuffer::Canvas;
use super::Rect;

/// Cloneable dirty flag wired to the render task's wakeup.
#[derive(Debug, Clone)]
pub struct Dirty {
    flag: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl Dirty {
    fn new(wake: Arc<Notify>) -> Dirty {
        Dirty {
            // widgets start dirty so they paint at least once
            flag: Arc::new(AtomicBool::new(true)),
            wake,
        }
    }

    /// Mark dirty and wake the render task.
    pub fn mark(&self) {
        self.flag.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Whether the flag is currently set.
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Consume the flag.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }
}

/// One rectangle of the tree.
pub trait Widget: Send {
    /// Panel-space bounds.
    fn bounds(&self) -> Rect;
    /// The widget's dirty handle.
    fn dirty(&self) -> &Dirty;
    /// Whether this widget's updates want the fast partial waveform.
    fn wants_fast(&self) -> bool {
        false
    }
    /// Advance animations; may mark dirty.
    fn tick(&mut self, _now: Instant) {}
    /// Paint into the widget-local canvas.
    fn render(&mut self, canvas: &mut Canvas<'_>);
}

/// The root of the tree: the widgets of the current screen.
pub struct Screen {
    name: &'static str,
    wake: Arc<Notify>,
    widgets: Vec<Box<dyn Widget>>,
}

impl std::fmt::Debug for Screen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Screen")
            .field("name", &self.name)
            .field("widgets", &self.widgets.len())
            .finish()
    }
}

impl Screen {
    /// An empty screen sharing the given wakeup.
    pub fn new(name: &'static str, wake: Arc<Notify>) -> Screen {
        Screen {
            name,
            wake,
            widgets: Vec::new(),
        }
    }

    /// Screen name (for logs).
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// A dirty handle bound to this screen's wakeup.
    pub fn dirty_handle(&self) -> Dirty {
        Dirty::new(self.wake.clone())
    }

    /// Add a widget.
    pub fn push(&mut self, widget: Box<dyn Widget>) {
        self.widgets.push(widget);
    }

    /// Replace every widget (screen switch) and rename.
    pub fn reset(&mut self, name: &'static str) {
        self.name = name;
        self.widgets.clear();
    }

    /// Tick animations.
    pub fn tick_all(&mut self, now: Instant) {
        for widget in &mut self.widgets {
            widget.tick(now);
        }
    }

    /// Consume dirty flags: `(index, bounds, wants_fast)` per dirty widget.
    pub fn take_dirty(&mut self) -> Vec<(usize, Rect, bool)> {
        self.widgets
            .iter()
            .enumerate()
            .filter(|(_, w)| w.dirty().take())
            .map(|(i, w)| (i, w.bounds(), w.wants_fast()))
            .collect()
    }

    /// Render one widget by index into the framebuffer.
    pub fn render_widget(
        &mut self,
        index: usize,
        fb: &mut super::framebuffer::Framebuffer,
    ) {
        if let Some(widget) = self.widgets.get_mut(index) {
            let bounds = widget.bounds();
            let mut canvas = fb.canvas(bounds);
            widget.render(&mut canvas);
        }
    }

    /// Mark every widget dirty (after a screen switch or a full repaint).
    pub fn mark_all_dirty(&self) {
        for widget in &self.widgets {
            widget.dirty().mark();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Blob {
        bounds: Rect,
        dirty: Dirty,
        painted: u32,
    }

    impl Widget for Blob {
        fn bounds(&self) -> Rect {
            self.bounds
        }
        fn dirty(&self) -> &Dirty {
            &self.dirty
        }
        fn render(&mut self, canvas: &mut Canvas<'_>) {
            self.painted += 1;
            canvas.set_local(0, 0, true);
        }
    }

    #[test]
    fn widgets_start_dirty_and_flags_are_consumed() {
        let wake = Arc::new(Notify::new());
        let mut screen = Screen::new("test", wake);
        let dirty = screen.dirty_handle();
        screen.push(Box::new(Blob {
            bounds: Rect::new(0, 0, 8, 8),
            dirty: dirty.clone(),
            painted: 0,
        }));

        let first = screen.take_dirty();
        assert_eq!(first.len(), 1);
        assert!(screen.take_dirty().is_empty(), "flag must be consumed");

        dirty.mark();
        assert_eq!(screen.take_dirty().len(), 1);
    }

    #[test]
    fn external_handles_mark_from_any_clone() {
        let wake = Arc::new(Notify::new());
        let screen = Screen::new("test", wake);
        let dirty = screen.dirty_handle();
        dirty.take();
        assert!(!dirty.is_set());
        let remote = dirty.clone();
        remote.mark();
        assert!(dirty.is_set());
    }
}
