use image::{ImageBuffer, Pixel, Rgb};
use parking_lot::Mutex;

type Frame<P> = ImageBuffer<P, Vec<<P as Pixel>::Subpixel>>;

/// Latest frame of every camera, one lock per camera so capture threads
/// never wait on each other.
pub struct FrameStore<P: Pixel = Rgb<u8>> {
    slots: Vec<Mutex<Option<Frame<P>>>>,
}

impl<P: Pixel> FrameStore<P> {
    pub fn new(cameras: usize) -> Self {
        Self {
            slots: (0..cameras).map(|_| Mutex::new(None)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Replace camera `camera`'s frame, returning the previous one. The
    /// frame is handed back when the index is out of range.
    pub fn publish(&self, camera: usize, frame: Frame<P>) -> Result<Option<Frame<P>>, Frame<P>> {
        match self.slots.get(camera) {
            Some(slot) => Ok(slot.lock().replace(frame)),
            None => Err(frame),
        }
    }

    /// Copy of the latest frame.
    pub fn latest(&self, camera: usize) -> Option<Frame<P>> {
        self.slots.get(camera)?.lock().clone()
    }

    pub fn take(&self, camera: usize) -> Option<Frame<P>> {
        self.slots.get(camera)?.lock().take()
    }

    /// Run `f` on the latest frame without copying it.
    pub fn with_frame<R>(&self, camera: usize, f: impl FnOnce(&Frame<P>) -> R) -> Option<R> {
        let slot = self.slots.get(camera)?.lock();
        slot.as_ref().map(f)
    }
}
