//! Staging uploads for device-local resources.
//!
//! A `KilnUploadContext` pairs a persistently mapped staging buffer with a command buffer on the
//! copy allocator's own copy queue. Data is pushed into the staging buffer, copy commands are
//! recorded against it, and `KilnCopyAllocator::submit` executes them and blocks until they are
//! done. Staging buffers are pooled; a context dropped without being submitted hands its buffer
//! back through a channel.

use crate::*;
use crossbeam_channel::{Receiver, Sender};
use kiln_base::memory;
use std::sync::Mutex;

#[derive(Debug)]
pub enum KilnUploadError {
    BufferFull,
    Other(KilnError),
}

impl KilnUploadError {
    // Helpful for when types are not being inferred as expected
    pub fn into_kiln_error(self) -> KilnError {
        self.into()
    }
}

impl core::fmt::Display for KilnUploadError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        match *self {
            KilnUploadError::BufferFull => write!(fmt, "UploadBufferFull"),
            KilnUploadError::Other(ref e) => e.fmt(fmt),
        }
    }
}

impl std::error::Error for KilnUploadError {}

impl From<KilnError> for KilnUploadError {
    fn from(error: KilnError) -> Self {
        KilnUploadError::Other(error)
    }
}

impl From<KilnUploadError> for KilnError {
    fn from(error: KilnUploadError) -> Self {
        match error {
            KilnUploadError::BufferFull => {
                KilnError::StringError("Upload buffer is full".to_string())
            }
            KilnUploadError::Other(e) => e,
        }
    }
}

impl From<&str> for KilnUploadError {
    fn from(str: &str) -> Self {
        KilnError::StringError(str.to_string()).into()
    }
}

impl From<String> for KilnUploadError {
    fn from(string: String) -> Self {
        KilnError::StringError(string).into()
    }
}

/// Accumulates staging writes and the copies that consume them
pub struct KilnUploadContext {
    staging_buffer: Option<KilnBuffer>,
    command_buffer: Option<KilnCommandBuffer>,
    write_offset: u64,
    staging_buffer_released_tx: Sender<KilnBuffer>,
}

impl std::fmt::Debug for KilnUploadContext {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("KilnUploadContext")
            .field("staging_buffer", &self.staging_buffer)
            .field("write_offset", &self.write_offset)
            .finish()
    }
}

impl Drop for KilnUploadContext {
    fn drop(&mut self) {
        if let Some(staging_buffer) = self.staging_buffer.take() {
            log::trace!("Upload context dropped without being submitted");
            // The command buffer returns its own recorder when it drops
            self.command_buffer = None;
            // If the allocator is gone the buffer is simply retired
            let _ = self.staging_buffer_released_tx.send(staging_buffer);
        }
    }
}

impl KilnUploadContext {
    fn staging(&self) -> KilnResult<&KilnBuffer> {
        self.staging_buffer.as_ref().ok_or_else(|| {
            KilnError::PreconditionViolation("The upload context was already submitted".into())
        })
    }

    fn parts(&mut self) -> KilnResult<(&KilnBuffer, &mut KilnCommandBuffer)> {
        match (&self.staging_buffer, &mut self.command_buffer) {
            (Some(staging_buffer), Some(command_buffer)) => Ok((staging_buffer, command_buffer)),
            _ => Err(KilnError::PreconditionViolation(
                "The upload context was already submitted".into(),
            )),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.staging_buffer
            .as_ref()
            .map(|x| x.buffer_def().size)
            .unwrap_or(0)
    }

    pub fn bytes_written(&self) -> u64 {
        self.write_offset
    }

    pub fn bytes_free(&self) -> u64 {
        self.capacity() - self.write_offset
    }

    pub fn staging_buffer(&self) -> Option<&KilnBuffer> {
        self.staging_buffer.as_ref()
    }

    /// Copy `data` into the staging buffer at the next offset aligned to `required_alignment`.
    /// Returns that offset.
    pub fn push(
        &mut self,
        data: &[u8],
        required_alignment: u64,
    ) -> Result<u64, KilnUploadError> {
        log::trace!("Pushing {} bytes into upload", data.len());

        let staging_buffer = self.staging()?;
        let offset = memory::round_size_up_to_alignment_u64(self.write_offset, required_alignment);
        let end = offset + data.len() as u64;
        if end > staging_buffer.buffer_def().size {
            return Err(KilnUploadError::BufferFull);
        }

        staging_buffer.write_mapped(offset, data)?;
        self.write_offset = end;
        Ok(offset)
    }

    /// Copy staged bytes into `dst`, moving it to `COPY_DEST` first
    pub fn copy_buffer(
        &mut self,
        dst: &KilnBuffer,
        dst_offset: u64,
        src_offset: u64,
        size: u64,
    ) -> KilnResult<()> {
        let (staging_buffer, command_buffer) = self.parts()?;
        command_buffer.buffer_barrier(dst, KilnBufferStates::COPY_DEST)?;
        command_buffer.copy_buffer(staging_buffer, src_offset, dst, dst_offset, size)
    }

    /// Copy staged rows into one texture subresource, moving it to `CopyDest` first
    pub fn copy_buffer_to_texture(
        &mut self,
        dst: &KilnTexture,
        mip_level: u32,
        array_layer: u32,
        src_offset: u64,
        row_pitch: u32,
    ) -> KilnResult<()> {
        let (staging_buffer, command_buffer) = self.parts()?;
        command_buffer.texture_barrier_with_options(
            dst,
            KilnTextureLayout::CopyDest,
            KilnSubresource::Single {
                mip_level,
                array_layer,
            },
            false,
        )?;
        command_buffer.copy_buffer_to_texture(
            staging_buffer,
            src_offset,
            row_pitch,
            dst,
            mip_level,
            array_layer,
        )
    }
}

/// Hands out upload contexts and runs them on a dedicated copy queue
pub struct KilnCopyAllocator {
    device_context: KilnDeviceContext,
    queue: KilnQueue,
    free_staging_buffers: Mutex<Vec<KilnBuffer>>,
    staging_buffer_released_tx: Sender<KilnBuffer>,
    staging_buffer_released_rx: Receiver<KilnBuffer>,
}

impl KilnCopyAllocator {
    pub(crate) fn new(device_context: &KilnDeviceContext) -> KilnResult<Self> {
        let queue = KilnQueue::new(device_context, KilnQueueType::Copy)?;
        let (staging_buffer_released_tx, staging_buffer_released_rx) =
            crossbeam_channel::unbounded();

        Ok(KilnCopyAllocator {
            device_context: device_context.clone(),
            queue,
            free_staging_buffers: Default::default(),
            staging_buffer_released_tx,
            staging_buffer_released_rx,
        })
    }

    pub fn queue(&self) -> &KilnQueue {
        &self.queue
    }

    pub fn free_context_count(&self) -> usize {
        self.free_staging_buffers.lock().unwrap().len() + self.staging_buffer_released_rx.len()
    }

    /// Reuse the first pooled staging buffer that holds `size` bytes, or create one of at least
    /// `MIN_UPLOAD_CONTEXT_SIZE` bytes rounded up to a power of two
    pub fn allocate(
        &self,
        size: u64,
    ) -> KilnResult<KilnUploadContext> {
        self.device_context.check_lost()?;

        let reused = {
            let mut free_staging_buffers = self.free_staging_buffers.lock().unwrap();
            free_staging_buffers.extend(self.staging_buffer_released_rx.try_iter());
            free_staging_buffers
                .iter()
                .position(|x| x.buffer_def().size >= size)
                .map(|index| free_staging_buffers.swap_remove(index))
        };

        let staging_buffer = match reused {
            Some(staging_buffer) => staging_buffer,
            None => {
                let capacity =
                    memory::next_power_of_two_at_least(size, crate::MIN_UPLOAD_CONTEXT_SIZE);
                log::debug!(
                    "Creating upload context of {} bytes for a {} byte request",
                    capacity,
                    size
                );
                KilnBuffer::new(
                    &self.device_context,
                    &KilnBufferDef {
                        label: Some("upload context".to_string()),
                        ..KilnBufferDef::for_staging_buffer(capacity)
                    },
                )?
            }
        };

        let command_buffer = match self.queue.begin_command_buffer(None) {
            Ok(command_buffer) => command_buffer,
            Err(e) => {
                self.free_staging_buffers.lock().unwrap().push(staging_buffer);
                return Err(e);
            }
        };

        Ok(KilnUploadContext {
            staging_buffer: Some(staging_buffer),
            command_buffer: Some(command_buffer),
            write_offset: 0,
            staging_buffer_released_tx: self.staging_buffer_released_tx.clone(),
        })
    }

    /// Execute the recorded copies and block until the copy queue has finished them
    pub fn submit(
        &self,
        mut context: KilnUploadContext,
    ) -> KilnResult<()> {
        profiling::scope!("KilnCopyAllocator::submit");
        let command_buffer = context.command_buffer.take().ok_or_else(|| {
            KilnError::PreconditionViolation("The upload context was already submitted".into())
        })?;

        let value = self.queue.submit(command_buffer)?;
        self.queue.wait_for_fence(value)?;

        // The copies are complete, so the recorder can be reused right away
        self.queue.finish_frame();

        if let Some(staging_buffer) = context.staging_buffer.take() {
            self.free_staging_buffers
                .lock()
                .unwrap()
                .push(staging_buffer);
        }

        log::trace!("Upload of {} bytes complete", context.write_offset);
        Ok(())
    }

    /// Fill a device-local buffer
    pub fn upload_buffer(
        &self,
        dst: &KilnBuffer,
        dst_offset: u64,
        data: &[u8],
    ) -> KilnResult<()> {
        profiling::scope!("KilnCopyAllocator::upload_buffer");
        let mut context = self.allocate(data.len() as u64)?;
        let src_offset = context.push(data, 4)?;
        context.copy_buffer(dst, dst_offset, src_offset, data.len() as u64)?;
        self.submit(context)
    }

    /// Fill every subresource of a texture. `data` holds tightly packed rows for each subresource
    /// in subresource order: mips of layer 0, then mips of layer 1 and so on. The texture is left
    /// in `CopyDest`.
    pub fn upload_texture(
        &self,
        dst: &KilnTexture,
        data: &[u8],
    ) -> KilnResult<()> {
        profiling::scope!("KilnCopyAllocator::upload_texture");
        let device_info = self.device_context.device_info();
        let texture_def = dst.texture_def();
        let format = texture_def.format;

        struct Subresource {
            mip_level: u32,
            array_layer: u32,
            row_size: u64,
            row_count: u64,
            depth: u64,
            row_pitch: u32,
        }

        let mut subresources = Vec::with_capacity(texture_def.subresource_count() as usize);
        let mut packed_size = 0;
        let mut staging_size = 0;
        for array_layer in 0..texture_def.array_layer_count() {
            for mip_level in 0..texture_def.mip_count {
                let width = (texture_def.extents.width >> mip_level).max(1);
                let height = (texture_def.extents.height >> mip_level).max(1);
                let depth = (texture_def.depth() >> mip_level).max(1) as u64;
                let row_size = format.row_size_in_bytes(width);
                let row_count = format.row_count(height) as u64;
                let row_pitch = memory::round_size_up_to_alignment_u64(
                    row_size,
                    device_info.upload_texture_row_alignment as u64,
                ) as u32;

                packed_size += row_size * row_count * depth;
                staging_size += row_pitch as u64 * row_count * depth
                    + device_info.upload_texture_alignment as u64;
                subresources.push(Subresource {
                    mip_level,
                    array_layer,
                    row_size,
                    row_count,
                    depth,
                    row_pitch,
                });
            }
        }

        if data.len() as u64 != packed_size {
            return Err(KilnError::ValidationError(format!(
                "Texture {:?} needs {} bytes of data, got {}",
                texture_def.label,
                packed_size,
                data.len()
            )));
        }

        let mut context = self.allocate(staging_size)?;
        let mut read_offset = 0;
        for subresource in &subresources {
            // Rows are padded out to the row pitch
            let row_pitch = subresource.row_pitch as usize;
            let row_size = subresource.row_size as usize;
            let rows = (subresource.row_count * subresource.depth) as usize;
            let mut padded = vec![0u8; row_pitch * rows];
            for row in 0..rows {
                padded[row * row_pitch..row * row_pitch + row_size]
                    .copy_from_slice(&data[read_offset..read_offset + row_size]);
                read_offset += row_size;
            }

            let src_offset =
                context.push(&padded, device_info.upload_texture_alignment as u64)?;
            context.copy_buffer_to_texture(
                dst,
                subresource.mip_level,
                subresource.array_layer,
                src_offset,
                subresource.row_pitch,
            )?;
        }

        self.submit(context)
    }
}

impl Drop for KilnCopyAllocator {
    fn drop(&mut self) {
        let mut free_staging_buffers = self.free_staging_buffers.lock().unwrap();
        free_staging_buffers.extend(self.staging_buffer_released_rx.try_iter());
        log::debug!(
            "Destroying copy allocator with {} staging buffers",
            free_staging_buffers.len()
        );
        free_staging_buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_device() -> KilnDevice {
        let _ = env_logger::builder().is_test(true).try_init();
        KilnDevice::new(&Default::default()).unwrap()
    }

    #[test]
    fn test_context_size_is_rounded_up() {
        let device = create_device();
        let copy_allocator = device.copy_allocator().unwrap();

        let context = copy_allocator.allocate(100).unwrap();
        assert_eq!(context.capacity(), crate::MIN_UPLOAD_CONTEXT_SIZE);
        drop(context);

        let context = copy_allocator.allocate(65537).unwrap();
        assert_eq!(context.capacity(), 131072);
        copy_allocator.submit(context).unwrap();
        assert_eq!(copy_allocator.free_context_count(), 2);
    }

    #[test]
    fn test_free_list_is_first_fit() {
        let device = create_device();
        let copy_allocator = device.copy_allocator().unwrap();

        let large = copy_allocator.allocate(200_000).unwrap();
        copy_allocator.submit(large).unwrap();

        // The pooled 256 KiB buffer satisfies a small request
        let small = copy_allocator.allocate(16).unwrap();
        assert_eq!(small.capacity(), 262144);
        assert_eq!(copy_allocator.free_context_count(), 0);
        copy_allocator.submit(small).unwrap();
    }

    #[test]
    fn test_push_reports_full_buffer() {
        let device = create_device();
        let copy_allocator = device.copy_allocator().unwrap();
        let mut context = copy_allocator.allocate(16).unwrap();

        assert_eq!(context.push(&[1, 2, 3], 1).unwrap(), 0);
        assert_eq!(context.push(&[4], 256).unwrap(), 256);
        assert_eq!(context.bytes_written(), 257);

        let too_large = vec![0u8; context.bytes_free() as usize + 1];
        assert!(matches!(
            context.push(&too_large, 1),
            Err(KilnUploadError::BufferFull)
        ));
        copy_allocator.submit(context).unwrap();
    }

    #[test]
    fn test_device_local_buffer_upload() {
        let device = create_device();
        let data: Vec<u8> = (0..128).collect();
        let buffer = device
            .create_buffer_with_data(
                &KilnBufferDef {
                    size: 128,
                    usage: KilnBufferUsage::VERTEX,
                    ..Default::default()
                },
                &data,
            )
            .unwrap();

        let null = device.null_device().unwrap();
        assert_eq!(null.buffer_contents(buffer.native_resource()), Some(data));
        assert_eq!(buffer.states(), KilnBufferStates::COPY_DEST);
    }

    #[test]
    fn test_texture_upload_checks_data_size() {
        let device = create_device();
        let def = KilnTextureDef {
            format: KilnFormat::R8G8B8A8Unorm,
            extents: KilnExtents3D {
                width: 4,
                height: 4,
                depth_or_array_layers: 1,
            },
            mip_count: 2,
            usage: KilnTextureUsage::SHADER_READ,
            ..Default::default()
        };

        // 4x4 and 2x2 texels of 4 bytes
        assert!(matches!(
            device.create_texture_with_data(&def, &[0u8; 64]),
            Err(KilnError::ValidationError(_))
        ));

        let texture = device.create_texture_with_data(&def, &[0u8; 80]).unwrap();
        assert_eq!(
            texture.subresource_layouts(),
            vec![KilnTextureLayout::CopyDest; 2]
        );
    }
}
