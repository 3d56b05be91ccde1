use crate::backends::KilnNativeDescriptor;
use crate::device_context::KilnRetiredItem;
use crate::*;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct KilnBindGroupTables {
    resource_first: Option<u32>,
    sampler_first: Option<u32>,
    // Keeps bound resources alive for as long as the group points at them
    bound_resources: Vec<KilnBindingResource>,
}

pub struct KilnBindGroupInner {
    device_context: KilnDeviceContext,
    layout: KilnBindGroupLayout,
    tables: Mutex<KilnBindGroupTables>,
    label: Option<String>,
}

impl KilnBindGroupInner {
    fn retire_tables(
        &self,
        tables: &KilnBindGroupTables,
    ) {
        if let Some(first) = tables.resource_first {
            self.device_context.retire(KilnRetiredItem::Descriptors {
                heap: KilnDescriptorHeapType::Resource,
                first,
                count: self.layout.resource_table_size(),
            });
        }

        if let Some(first) = tables.sampler_first {
            self.device_context.retire(KilnRetiredItem::Descriptors {
                heap: KilnDescriptorHeapType::Sampler,
                first,
                count: self.layout.sampler_table_size(),
            });
        }
    }
}

impl Drop for KilnBindGroupInner {
    fn drop(&mut self) {
        let tables = std::mem::take(&mut *self.tables.lock().unwrap());
        self.retire_tables(&tables);
    }
}

/// Concrete resources bound to the slots of a `KilnBindGroupLayout`. Owns one descriptor table
/// per heap the layout uses.
#[derive(Clone)]
pub struct KilnBindGroup {
    inner: Arc<KilnBindGroupInner>,
}

impl std::fmt::Debug for KilnBindGroup {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let tables = self.inner.tables.lock().unwrap();
        f.debug_struct("KilnBindGroup")
            .field("label", &self.inner.label)
            .field("resource_first", &tables.resource_first)
            .field("sampler_first", &tables.sampler_first)
            .finish()
    }
}

impl PartialEq for KilnBindGroup {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for KilnBindGroup {}

fn check_buffer_range(
    buffer: &KilnBuffer,
    offset: u64,
    size: u64,
) -> KilnResult<()> {
    let buffer_size = buffer.buffer_def().size;
    let in_range = size > 0
        && offset
            .checked_add(size)
            .map(|end| end <= buffer_size)
            .unwrap_or(false);
    if !in_range {
        return Err(KilnError::ValidationError(format!(
            "Bound range {}..+{} is outside of a {} byte buffer",
            offset, size, buffer_size
        )));
    }

    Ok(())
}

fn require_buffer_usage(
    buffer: &KilnBuffer,
    usage: KilnBufferUsage,
) -> KilnResult<()> {
    if !buffer.buffer_def().usage.contains(usage) {
        return Err(KilnError::ValidationError(format!(
            "Buffer {:?} was not created with {:?}",
            buffer.buffer_def().label,
            usage
        )));
    }

    Ok(())
}

fn require_texture_usage(
    texture: &KilnTexture,
    usage: KilnTextureUsage,
) -> KilnResult<()> {
    if !texture.texture_def().usage.contains(usage) {
        return Err(KilnError::ValidationError(format!(
            "Texture {:?} was not created with {:?}",
            texture.texture_def().label,
            usage
        )));
    }

    Ok(())
}

fn native_descriptor(
    device_context: &KilnDeviceContext,
    resource: &KilnBindingResource,
) -> KilnResult<KilnNativeDescriptor> {
    Ok(match resource {
        KilnBindingResource::ConstantBuffer {
            buffer,
            offset,
            size,
        } => {
            require_buffer_usage(buffer, KilnBufferUsage::CONSTANT)?;
            check_buffer_range(buffer, *offset, *size)?;
            let alignment = device_context
                .device_info()
                .min_constant_buffer_offset_alignment as u64;
            if offset % alignment != 0 {
                return Err(KilnError::ValidationError(format!(
                    "Constant buffer offset {} is not aligned to {}",
                    offset, alignment
                )));
            }

            let view_size = kiln_base::memory::round_size_up_to_alignment_u64(*size, alignment);
            if offset + view_size > buffer.allocation_size() {
                return Err(KilnError::ValidationError(format!(
                    "Constant buffer view {}..+{} runs past a {} byte allocation",
                    offset,
                    view_size,
                    buffer.allocation_size()
                )));
            }

            KilnNativeDescriptor::ConstantBufferView {
                resource: buffer.native_resource(),
                offset: *offset,
                size: view_size,
            }
        }
        KilnBindingResource::Buffer {
            buffer,
            offset,
            size,
        } => {
            require_buffer_usage(buffer, KilnBufferUsage::SHADER_READ)?;
            check_buffer_range(buffer, *offset, *size)?;
            KilnNativeDescriptor::BufferShaderResourceView {
                resource: buffer.native_resource(),
                offset: *offset,
                size: *size,
            }
        }
        KilnBindingResource::StorageBuffer {
            buffer,
            offset,
            size,
        } => {
            require_buffer_usage(buffer, KilnBufferUsage::SHADER_WRITE)?;
            check_buffer_range(buffer, *offset, *size)?;
            KilnNativeDescriptor::BufferUnorderedAccessView {
                resource: buffer.native_resource(),
                offset: *offset,
                size: *size,
            }
        }
        KilnBindingResource::Texture { texture } => {
            require_texture_usage(texture, KilnTextureUsage::SHADER_READ)?;
            texture.shader_resource_descriptor()
        }
        KilnBindingResource::StorageTexture { texture, mip_level } => {
            require_texture_usage(texture, KilnTextureUsage::SHADER_WRITE)?;
            if *mip_level >= texture.texture_def().mip_count {
                return Err(KilnError::ValidationError(format!(
                    "Mip {} is out of range for texture {:?}",
                    mip_level,
                    texture.texture_def().label
                )));
            }
            texture.unordered_access_descriptor(*mip_level)
        }
        KilnBindingResource::Sampler(sampler) => sampler.descriptor(),
    })
}

impl KilnBindGroup {
    pub(crate) fn new(
        device_context: &KilnDeviceContext,
        bind_group_def: &KilnBindGroupDef,
    ) -> KilnResult<Self> {
        device_context.check_lost()?;
        bind_group_def.verify()?;

        let inner = KilnBindGroupInner {
            device_context: device_context.clone(),
            layout: bind_group_def.layout.clone(),
            tables: Default::default(),
            label: bind_group_def.label.clone(),
        };

        let bind_group = KilnBindGroup {
            inner: Arc::new(inner),
        };
        bind_group.update(&bind_group_def.entries)?;
        Ok(bind_group)
    }

    pub fn layout(&self) -> &KilnBindGroupLayout {
        &self.inner.layout
    }

    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    /// First descriptor of the resource table, if the layout has resource slots
    pub fn resource_table_base(&self) -> Option<u32> {
        self.inner.tables.lock().unwrap().resource_first
    }

    /// First descriptor of the sampler table, if the layout has sampler slots
    pub fn sampler_table_base(&self) -> Option<u32> {
        self.inner.tables.lock().unwrap().sampler_first
    }

    pub fn bound_resource_count(&self) -> usize {
        self.inner.tables.lock().unwrap().bound_resources.len()
    }

    /// Rewrite every slot. Slots without an entry get a null descriptor of the slot's kind.
    ///
    /// New tables are allocated for every update. The previous tables are released through the
    /// retirement queue, so command lists already recorded against them stay valid.
    pub fn update(
        &self,
        entries: &[KilnBindGroupEntry],
    ) -> KilnResult<()> {
        profiling::scope!("KilnBindGroup::update");
        let device_context = &self.inner.device_context;
        let layout = &self.inner.layout;
        device_context.check_lost()?;
        layout.verify_entries(entries)?;

        let mut resource_descriptors = Vec::with_capacity(layout.resource_table_size() as usize);
        resource_descriptors.resize(
            layout.resource_table_size() as usize,
            KilnNativeDescriptor::NullShaderResourceView,
        );
        let mut sampler_descriptors = Vec::with_capacity(layout.sampler_table_size() as usize);
        sampler_descriptors.resize(
            layout.sampler_table_size() as usize,
            KilnNativeDescriptor::DefaultSampler,
        );

        for (_, slot) in layout.slots() {
            let table = match slot.heap_type {
                KilnDescriptorHeapType::Sampler => &mut sampler_descriptors,
                _ => &mut resource_descriptors,
            };
            for i in 0..slot.count {
                table[(slot.table_offset + i) as usize] = slot.null_descriptor();
            }
        }

        for entry in entries {
            // verify_entries guarantees the slot exists
            let slot = match layout.slot(entry.binding) {
                Some(slot) => slot,
                None => continue,
            };
            let table = match slot.heap_type {
                KilnDescriptorHeapType::Sampler => &mut sampler_descriptors,
                _ => &mut resource_descriptors,
            };
            table[(slot.table_offset + entry.array_element) as usize] =
                native_descriptor(device_context, &entry.resource)?;
        }

        let resource_first = if resource_descriptors.is_empty() {
            None
        } else {
            Some(device_context.allocate_descriptors(
                KilnDescriptorHeapType::Resource,
                resource_descriptors.len() as u32,
            )?)
        };

        let sampler_first = if sampler_descriptors.is_empty() {
            None
        } else {
            match device_context.allocate_descriptors(
                KilnDescriptorHeapType::Sampler,
                sampler_descriptors.len() as u32,
            ) {
                Ok(first) => Some(first),
                Err(e) => {
                    // Nothing references the resource range yet so it can go back right away
                    if let Some(first) = resource_first {
                        device_context
                            .resource_heap()
                            .release(first, resource_descriptors.len() as u32)?;
                    }
                    return Err(e);
                }
            }
        };

        if let Some(first) = resource_first {
            device_context
                .resource_heap()
                .write_table(first, &resource_descriptors);
        }
        if let Some(first) = sampler_first {
            device_context
                .sampler_heap()
                .write_table(first, &sampler_descriptors);
        }

        let new_tables = KilnBindGroupTables {
            resource_first,
            sampler_first,
            bound_resources: entries.iter().map(|x| x.resource.clone()).collect(),
        };
        let old_tables = std::mem::replace(&mut *self.inner.tables.lock().unwrap(), new_tables);
        self.inner.retire_tables(&old_tables);

        log::trace!(
            "Updated bind group {:?}: resource table {:?}, sampler table {:?}",
            self.inner.label,
            resource_first,
            sampler_first
        );

        Ok(())
    }
}
