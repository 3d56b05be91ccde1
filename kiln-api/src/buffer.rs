use crate::backends::KilnNativeResource;
use crate::device_context::{KilnObjectKey, KilnRetiredItem};
use crate::*;
use std::sync::{Arc, Mutex, MutexGuard};

pub struct KilnBufferInner {
    device_context: KilnDeviceContext,
    key: KilnObjectKey,
    resource: KilnNativeResource,
    buffer_def: KilnBufferDef,
    allocation_size: u64,
    states: Mutex<KilnTrackedState<KilnBufferStates>>,
}

impl Drop for KilnBufferInner {
    fn drop(&mut self) {
        self.device_context.retire(KilnRetiredItem::Object(self.key));
    }
}

/// A GPU buffer. Clones share the same buffer; it is retired when the last clone is dropped.
#[derive(Clone)]
pub struct KilnBuffer {
    inner: Arc<KilnBufferInner>,
}

impl std::fmt::Debug for KilnBuffer {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("KilnBuffer")
            .field("resource", &self.inner.resource)
            .field("buffer_def", &self.inner.buffer_def)
            .finish()
    }
}

impl PartialEq for KilnBuffer {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for KilnBuffer {}

impl KilnBuffer {
    pub(crate) fn new(
        device_context: &KilnDeviceContext,
        buffer_def: &KilnBufferDef,
    ) -> KilnResult<Self> {
        device_context.check_lost()?;
        buffer_def.verify()?;

        let required_features = [
            (KilnBufferUsage::PREDICATION, KilnFeature::Predication),
            (KilnBufferUsage::RAY_TRACING, KilnFeature::RayTracing),
        ];
        for (usage, feature) in required_features.iter() {
            if buffer_def.usage.contains(*usage)
                && !device_context.native().supports_feature(*feature)
            {
                return Err(KilnError::ValidationError(format!(
                    "Buffer usage {:?} requires {:?}",
                    usage, feature
                )));
            }
        }

        let initial_states = match buffer_def.memory_type {
            KilnMemoryType::Upload => KilnBufferStates::GENERIC_READ,
            KilnMemoryType::Readback => KilnBufferStates::COPY_DEST,
            KilnMemoryType::Private => KilnBufferStates::UNDEFINED,
        };

        // Constant buffer views cover whole alignment units, so the allocation is padded to one
        let mut allocation_def = buffer_def.clone();
        if buffer_def.usage.contains(KilnBufferUsage::CONSTANT) {
            let alignment = device_context
                .device_info()
                .min_constant_buffer_offset_alignment as u64;
            allocation_def.size =
                kiln_base::memory::round_size_up_to_alignment_u64(buffer_def.size, alignment);
        }

        let initial_resource_state = initial_states.to_resource_state(KilnQueueType::Graphics);
        let resource = device_context
            .create_native(|native| native.create_buffer(&allocation_def, initial_resource_state))?;
        let key = device_context.register_object(resource.into());

        log::trace!("Created buffer {:?} {:?}", resource, buffer_def.label);

        let inner = KilnBufferInner {
            device_context: device_context.clone(),
            key,
            resource,
            buffer_def: buffer_def.clone(),
            allocation_size: allocation_def.size,
            states: Mutex::new(KilnTrackedState::new(initial_states, initial_resource_state)),
        };

        Ok(KilnBuffer {
            inner: Arc::new(inner),
        })
    }

    pub fn buffer_def(&self) -> &KilnBufferDef {
        &self.inner.buffer_def
    }

    pub fn native_resource(&self) -> KilnNativeResource {
        self.inner.resource
    }

    /// Size of the native allocation. Constant buffers are padded to the constant buffer alignment.
    pub fn allocation_size(&self) -> u64 {
        self.inner.allocation_size
    }

    pub fn key(&self) -> KilnObjectKey {
        self.inner.key
    }

    pub fn states(&self) -> KilnBufferStates {
        self.inner.states.lock().unwrap().requested
    }

    pub(crate) fn tracked_states(&self) -> MutexGuard<KilnTrackedState<KilnBufferStates>> {
        self.inner.states.lock().unwrap()
    }

    pub(crate) fn check_range(
        &self,
        offset: u64,
        length: u64,
    ) -> KilnResult<()> {
        let in_range = offset
            .checked_add(length)
            .map(|end| end <= self.inner.buffer_def.size)
            .unwrap_or(false);
        if !in_range {
            return Err(KilnError::ValidationError(format!(
                "Range {}..+{} is outside of a {} byte buffer",
                offset, length, self.inner.buffer_def.size
            )));
        }

        Ok(())
    }

    /// Write through the persistent mapping. Only `Upload` buffers can be written by the CPU.
    pub fn write_mapped(
        &self,
        offset: u64,
        data: &[u8],
    ) -> KilnResult<()> {
        if self.inner.buffer_def.memory_type != KilnMemoryType::Upload {
            return Err(KilnError::PreconditionViolation(format!(
                "Cannot write to a {:?} buffer from the CPU",
                self.inner.buffer_def.memory_type
            )));
        }

        self.check_range(offset, data.len() as u64)?;
        self.inner
            .device_context
            .create_native(|native| native.write_mapped(self.inner.resource, offset, data))
    }

    pub fn copy_to_host_visible_buffer<T: Copy>(
        &self,
        data: &[T],
    ) -> KilnResult<()> {
        self.copy_to_host_visible_buffer_with_offset(data, 0)
    }

    pub fn copy_to_host_visible_buffer_with_offset<T: Copy>(
        &self,
        data: &[T],
        buffer_byte_offset: u64,
    ) -> KilnResult<()> {
        self.write_mapped(
            buffer_byte_offset,
            kiln_base::memory::slice_as_bytes(data),
        )
    }

    /// Read through the persistent mapping of an `Upload` or `Readback` buffer
    pub fn read_mapped(
        &self,
        offset: u64,
        length: u64,
    ) -> KilnResult<Vec<u8>> {
        if !self.inner.buffer_def.memory_type.is_cpu_visible() {
            return Err(KilnError::PreconditionViolation(
                "Cannot read a Private buffer from the CPU".to_string(),
            ));
        }

        self.check_range(offset, length)?;
        self.inner
            .device_context
            .create_native(|native| native.read_mapped(self.inner.resource, offset, length))
    }
}
