use crate::backends::KilnNativeSwapChain;
use crate::device_context::KilnRetiredItem;
use crate::*;
use raw_window_handle::{HasRawWindowHandle, RawWindowHandle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Platform window handle captured at the window-system boundary. Pointers are stored as integers
/// so the handle can cross threads.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum KilnSurfaceHandle {
    Windows { hwnd: usize },
    Xlib { window: u64, display: usize },
    Wayland { surface: usize, display: usize },
    /// No window, back buffers are only rendered to
    Headless,
}

impl KilnSurfaceHandle {
    pub fn from_raw_window_handle(raw_window_handle: RawWindowHandle) -> KilnResult<Self> {
        match raw_window_handle {
            #[cfg(target_os = "windows")]
            RawWindowHandle::Windows(handle) => Ok(KilnSurfaceHandle::Windows {
                hwnd: handle.hwnd as usize,
            }),
            #[cfg(any(
                target_os = "linux",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            RawWindowHandle::Xlib(handle) => Ok(KilnSurfaceHandle::Xlib {
                window: handle.window as u64,
                display: handle.display as usize,
            }),
            #[cfg(any(
                target_os = "linux",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            RawWindowHandle::Wayland(handle) => Ok(KilnSurfaceHandle::Wayland {
                surface: handle.surface as usize,
                display: handle.display as usize,
            }),
            _ => Err(KilnError::ValidationError(
                "Cannot create a surface for this kind of window".to_string(),
            )),
        }
    }
}

struct KilnSurfaceInner {
    handle: KilnSurfaceHandle,
    size: Mutex<KilnExtents2D>,
    change_count: AtomicU64,
}

/// A window (or headless target) that swap chains present to. The window layer reports size
/// changes with `size_changed` and swap chains pick them up on their next acquire.
#[derive(Clone)]
pub struct KilnSurface {
    inner: Arc<KilnSurfaceInner>,
}

impl std::fmt::Debug for KilnSurface {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("KilnSurface")
            .field("handle", &self.inner.handle)
            .field("size", &self.size())
            .finish()
    }
}

impl KilnSurface {
    pub fn new(
        window: &dyn HasRawWindowHandle,
        width: u32,
        height: u32,
    ) -> KilnResult<Self> {
        let handle = KilnSurfaceHandle::from_raw_window_handle(window.raw_window_handle())?;
        Ok(Self::from_handle(handle, width, height))
    }

    pub fn headless(
        width: u32,
        height: u32,
    ) -> Self {
        Self::from_handle(KilnSurfaceHandle::Headless, width, height)
    }

    pub fn from_handle(
        handle: KilnSurfaceHandle,
        width: u32,
        height: u32,
    ) -> Self {
        let inner = KilnSurfaceInner {
            handle,
            size: Mutex::new(KilnExtents2D { width, height }),
            change_count: AtomicU64::new(0),
        };

        KilnSurface {
            inner: Arc::new(inner),
        }
    }

    pub fn handle(&self) -> &KilnSurfaceHandle {
        &self.inner.handle
    }

    pub fn size(&self) -> KilnExtents2D {
        *self.inner.size.lock().unwrap()
    }

    /// Incremented by every `size_changed` call that changes the size
    pub fn change_count(&self) -> u64 {
        self.inner.change_count.load(Ordering::Acquire)
    }

    pub fn size_changed(
        &self,
        width: u32,
        height: u32,
    ) {
        let mut size = self.inner.size.lock().unwrap();
        let new_size = KilnExtents2D { width, height };
        if *size != new_size {
            *size = new_size;
            self.inner.change_count.fetch_add(1, Ordering::AcqRel);
        }
    }
}

struct KilnSwapChainState {
    extents: KilnExtents2D,
    observed_change_count: u64,
    back_buffers: Vec<KilnTexture>,
}

pub struct KilnSwapChainInner {
    device_context: KilnDeviceContext,
    swap_chain: KilnNativeSwapChain,
    swap_chain_def: KilnSwapChainDef,
    surface: KilnSurface,
    graphics_queue: Weak<KilnQueue>,
    state: Mutex<KilnSwapChainState>,
}

impl Drop for KilnSwapChainInner {
    fn drop(&mut self) {
        self.state.lock().unwrap().back_buffers.clear();
        self.device_context
            .retire(KilnRetiredItem::NativeObject(self.swap_chain.into()));
    }
}

/// A ring of back buffers presented to a surface. Presents are queued on a graphics command
/// buffer and happen when the frame is committed.
#[derive(Clone)]
pub struct KilnSwapChain {
    inner: Arc<KilnSwapChainInner>,
}

impl std::fmt::Debug for KilnSwapChain {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("KilnSwapChain")
            .field("swap_chain", &self.inner.swap_chain)
            .field("format", &self.inner.swap_chain_def.format)
            .field("present_mode", &self.inner.swap_chain_def.present_mode)
            .finish()
    }
}

impl PartialEq for KilnSwapChain {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl KilnSwapChain {
    pub(crate) fn new(
        device_context: &KilnDeviceContext,
        graphics_queue: &Arc<KilnQueue>,
        surface: &KilnSurface,
        swap_chain_def: &KilnSwapChainDef,
    ) -> KilnResult<Self> {
        device_context.check_lost()?;
        swap_chain_def.verify()?;

        let swap_chain = device_context.create_native(|native| {
            native.create_swap_chain(
                graphics_queue.native_queue(),
                surface.handle(),
                swap_chain_def,
            )
        })?;

        let extents = KilnExtents2D {
            width: swap_chain_def.width,
            height: swap_chain_def.height,
        };
        let back_buffers =
            match Self::wrap_back_buffers(device_context, swap_chain, swap_chain_def, extents) {
                Ok(back_buffers) => back_buffers,
                Err(e) => {
                    device_context.native().destroy(swap_chain.into());
                    return Err(e);
                }
            };

        log::debug!(
            "Created swap chain {:?} {}x{} with {} back buffers",
            swap_chain,
            extents.width,
            extents.height,
            back_buffers.len()
        );

        let inner = KilnSwapChainInner {
            device_context: device_context.clone(),
            swap_chain,
            swap_chain_def: swap_chain_def.clone(),
            surface: surface.clone(),
            graphics_queue: Arc::downgrade(graphics_queue),
            state: Mutex::new(KilnSwapChainState {
                extents,
                observed_change_count: surface.change_count(),
                back_buffers,
            }),
        };

        Ok(KilnSwapChain {
            inner: Arc::new(inner),
        })
    }

    fn wrap_back_buffers(
        device_context: &KilnDeviceContext,
        swap_chain: KilnNativeSwapChain,
        swap_chain_def: &KilnSwapChainDef,
        extents: KilnExtents2D,
    ) -> KilnResult<Vec<KilnTexture>> {
        let resources = device_context
            .native()
            .swap_chain_back_buffers(swap_chain)
            .map_err(|e| device_context.handle_native_error(e))?;

        let texture_def = KilnTextureDef {
            format: swap_chain_def.format,
            extents: KilnExtents3D {
                width: extents.width,
                height: extents.height,
                depth_or_array_layers: 1,
            },
            usage: KilnTextureUsage::RENDER_TARGET,
            label: swap_chain_def.label.clone(),
            ..Default::default()
        };

        Ok(resources
            .into_iter()
            .map(|resource| {
                KilnTexture::from_back_buffer(device_context, resource, texture_def.clone())
            })
            .collect())
    }

    pub fn native_swap_chain(&self) -> KilnNativeSwapChain {
        self.inner.swap_chain
    }

    pub fn swap_chain_def(&self) -> &KilnSwapChainDef {
        &self.inner.swap_chain_def
    }

    pub fn surface(&self) -> &KilnSurface {
        &self.inner.surface
    }

    pub fn format(&self) -> KilnFormat {
        self.inner.swap_chain_def.format
    }

    pub fn present_mode(&self) -> KilnPresentMode {
        self.inner.swap_chain_def.present_mode
    }

    pub fn extents(&self) -> KilnExtents2D {
        self.inner.state.lock().unwrap().extents
    }

    pub fn back_buffer_count(&self) -> usize {
        self.inner.state.lock().unwrap().back_buffers.len()
    }

    pub fn back_buffers(&self) -> Vec<KilnTexture> {
        self.inner.state.lock().unwrap().back_buffers.clone()
    }

    /// Recreates the back buffers if the surface was resized since the last acquire, then returns
    /// the back buffer to render into this frame. A zero-sized surface keeps the old back buffers.
    pub fn acquire_next_texture(&self) -> KilnResult<KilnTexture> {
        self.inner.device_context.check_lost()?;

        let change_count = self.inner.surface.change_count();
        let observed_change_count = self.inner.state.lock().unwrap().observed_change_count;
        if change_count != observed_change_count {
            let size = self.inner.surface.size();
            if size.width == 0 || size.height == 0 {
                log::warn!(
                    "Surface of {:?} is {}x{}, keeping the old back buffers",
                    self.inner.swap_chain,
                    size.width,
                    size.height
                );
            } else {
                self.resize(size.width, size.height)?;
            }

            self.inner.state.lock().unwrap().observed_change_count = change_count;
        }

        self.current_back_buffer()
    }

    /// Waits for the graphics queue to go idle and recreates the back buffers at the new size
    pub fn resize(
        &self,
        width: u32,
        height: u32,
    ) -> KilnResult<()> {
        let device_context = &self.inner.device_context;
        device_context.check_lost()?;

        if width == 0 || height == 0 {
            return Err(KilnError::ValidationError(format!(
                "Cannot resize a swap chain to {}x{}",
                width, height
            )));
        }

        let extents = KilnExtents2D { width, height };
        if self.extents() == extents {
            return Ok(());
        }

        match self.inner.graphics_queue.upgrade() {
            Some(queue) => queue.wait_idle()?,
            None => {
                return Err(KilnError::PreconditionViolation(
                    "The device that created this swap chain was dropped".to_string(),
                ))
            }
        }

        log::debug!(
            "Recreating back buffers of {:?} at {}x{}",
            self.inner.swap_chain,
            width,
            height
        );

        let mut state = self.inner.state.lock().unwrap();
        state.back_buffers.clear();
        device_context
            .native()
            .resize_swap_chain(self.inner.swap_chain, width, height)
            .map_err(|e| device_context.handle_native_error(e))?;

        state.back_buffers = Self::wrap_back_buffers(
            device_context,
            self.inner.swap_chain,
            &self.inner.swap_chain_def,
            extents,
        )?;
        state.extents = extents;
        Ok(())
    }

    pub(crate) fn current_back_buffer(&self) -> KilnResult<KilnTexture> {
        let index = self
            .inner
            .device_context
            .native()
            .current_back_buffer_index(self.inner.swap_chain);
        let state = self.inner.state.lock().unwrap();
        state
            .back_buffers
            .get(index as usize)
            .cloned()
            .ok_or_else(|| {
                KilnError::BackendError(format!(
                    "Back buffer {} of {:?} does not exist",
                    index, self.inner.swap_chain
                ))
            })
    }

    pub(crate) fn present(&self) -> KilnResult<()> {
        let device_context = &self.inner.device_context;
        device_context
            .native()
            .present(
                self.inner.swap_chain,
                self.inner.swap_chain_def.present_mode.sync_interval(),
            )
            .map_err(|e| device_context.handle_native_error(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::null::NullCall;

    fn swap_chain_def(present_mode: KilnPresentMode) -> KilnSwapChainDef {
        KilnSwapChainDef {
            width: 640,
            height: 480,
            present_mode,
            ..Default::default()
        }
    }

    #[test]
    fn test_swap_chain_def_is_validated() {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = KilnDevice::new(&Default::default()).unwrap();
        let surface = KilnSurface::headless(640, 480);

        let result = device.create_swap_chain(
            &surface,
            &KilnSwapChainDef {
                width: 0,
                ..swap_chain_def(KilnPresentMode::Fifo)
            },
        );
        assert!(matches!(result, Err(KilnError::ValidationError(_))));

        let result = device.create_swap_chain(
            &surface,
            &KilnSwapChainDef {
                format: KilnFormat::Undefined,
                ..swap_chain_def(KilnPresentMode::Fifo)
            },
        );
        assert!(matches!(result, Err(KilnError::ValidationError(_))));
    }

    #[test]
    fn test_back_buffer_count_follows_present_mode() {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = KilnDevice::new(&Default::default()).unwrap();
        let surface = KilnSurface::headless(640, 480);

        let fifo = device
            .create_swap_chain(&surface, &swap_chain_def(KilnPresentMode::Fifo))
            .unwrap();
        assert_eq!(fifo.back_buffer_count(), 2);

        let mailbox = device
            .create_swap_chain(&surface, &swap_chain_def(KilnPresentMode::Mailbox))
            .unwrap();
        assert_eq!(mailbox.back_buffer_count(), 3);

        for back_buffer in mailbox.back_buffers() {
            assert!(back_buffer.is_back_buffer());
            assert_eq!(
                back_buffer.subresource_layout(0, 0),
                Some(KilnTextureLayout::Present)
            );
            assert_eq!(back_buffer.texture_def().extents.width, 640);
        }
    }

    #[test]
    fn test_present_advances_back_buffer() {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = KilnDevice::new(&Default::default()).unwrap();
        let null = device.null_device().unwrap();
        let surface = KilnSurface::headless(640, 480);
        let swap_chain = device
            .create_swap_chain(&surface, &swap_chain_def(KilnPresentMode::Fifo))
            .unwrap();
        let back_buffers = swap_chain.back_buffers();

        let texture = swap_chain.acquire_next_texture().unwrap();
        assert_eq!(texture.native_resource(), back_buffers[0].native_resource());

        let mut command_buffer = device
            .begin_command_buffer(KilnQueueType::Graphics)
            .unwrap();
        command_buffer
            .texture_barrier(&texture, KilnTextureLayout::RenderTarget)
            .unwrap();
        command_buffer.present(&swap_chain).unwrap();
        command_buffer.present(&swap_chain).unwrap();
        device
            .queue(KilnQueueType::Graphics)
            .unwrap()
            .submit(command_buffer)
            .unwrap();
        assert_eq!(
            texture.subresource_layout(0, 0),
            Some(KilnTextureLayout::Present)
        );

        let start = null.call_count();
        device.commit_frame().unwrap();
        let presents = null
            .calls_since(start)
            .into_iter()
            .filter(|x| match x {
                NullCall::Present { sync_interval, .. } => {
                    assert_eq!(*sync_interval, 1);
                    true
                }
                _ => false,
            })
            .count();
        assert_eq!(presents, 1);

        let texture = swap_chain.acquire_next_texture().unwrap();
        assert_eq!(texture.native_resource(), back_buffers[1].native_resource());
    }

    #[test]
    fn test_surface_resize_recreates_back_buffers() {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = KilnDevice::new(&Default::default()).unwrap();
        let null = device.null_device().unwrap();
        let surface = KilnSurface::headless(640, 480);
        let swap_chain = device
            .create_swap_chain(&surface, &swap_chain_def(KilnPresentMode::Fifo))
            .unwrap();
        let old_back_buffers = swap_chain.back_buffers();

        // Minimized windows keep their back buffers
        surface.size_changed(0, 0);
        swap_chain.acquire_next_texture().unwrap();
        assert_eq!(swap_chain.extents().width, 640);
        assert!(null
            .is_object_alive(old_back_buffers[0].native_resource().null_id().unwrap()));

        surface.size_changed(800, 600);
        let start = null.call_count();
        let texture = swap_chain.acquire_next_texture().unwrap();
        assert!(null.calls_since(start).iter().any(|x| match x {
            NullCall::ResizeSwapChain { width, height, .. } => *width == 800 && *height == 600,
            _ => false,
        }));
        assert_eq!(
            swap_chain.extents(),
            KilnExtents2D {
                width: 800,
                height: 600
            }
        );
        assert_eq!(texture.texture_def().extents.height, 600);
        assert_eq!(swap_chain.back_buffer_count(), 2);
        assert!(!null
            .is_object_alive(old_back_buffers[0].native_resource().null_id().unwrap()));

        // Nothing changed since the last acquire
        let start = null.call_count();
        swap_chain.acquire_next_texture().unwrap();
        assert!(!null
            .calls_since(start)
            .iter()
            .any(|x| matches!(x, NullCall::ResizeSwapChain { .. })));

        assert!(matches!(
            swap_chain.resize(0, 600),
            Err(KilnError::ValidationError(_))
        ));
    }

    #[test]
    fn test_failed_present_marks_device_lost() {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = KilnDevice::new(&Default::default()).unwrap();
        let null = device.null_device().unwrap();
        let surface = KilnSurface::headless(640, 480);
        let swap_chain = device
            .create_swap_chain(&surface, &swap_chain_def(KilnPresentMode::Immediate))
            .unwrap();

        let mut command_buffer = device
            .begin_command_buffer(KilnQueueType::Graphics)
            .unwrap();
        command_buffer.present(&swap_chain).unwrap();
        device
            .queue(KilnQueueType::Graphics)
            .unwrap()
            .submit(command_buffer)
            .unwrap();

        null.fail_next_present();
        device.commit_frame().unwrap();
        assert!(device.is_lost());

        assert!(matches!(
            device.begin_command_buffer(KilnQueueType::Graphics),
            Err(KilnError::DeviceLost)
        ));
        assert!(matches!(
            swap_chain.acquire_next_texture(),
            Err(KilnError::DeviceLost)
        ));
        assert!(matches!(device.commit_frame(), Err(KilnError::DeviceLost)));
    }
}
