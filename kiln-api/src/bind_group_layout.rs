use crate::backends::{KilnNativeBindGroupLayout, KilnNativeDescriptor};
use crate::device_context::{KilnObjectKey, KilnRetiredItem};
use crate::*;
use fnv::FnvHashMap;
use std::sync::Arc;

/// Where a layout entry lives inside its bind group's descriptor tables
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KilnBindingSlot {
    pub kind: KilnBindingKind,
    pub heap_type: KilnDescriptorHeapType,
    /// First descriptor of this entry, relative to the start of its table
    pub table_offset: u32,
    pub count: u32,
}

impl KilnBindingSlot {
    /// Written into slots the bind group does not bind
    pub(crate) fn null_descriptor(&self) -> KilnNativeDescriptor {
        match self.kind {
            KilnBindingKind::ConstantBuffer => KilnNativeDescriptor::NullConstantBufferView,
            KilnBindingKind::Buffer | KilnBindingKind::Texture => {
                KilnNativeDescriptor::NullShaderResourceView
            }
            KilnBindingKind::StorageBuffer | KilnBindingKind::StorageTexture => {
                KilnNativeDescriptor::NullUnorderedAccessView
            }
            KilnBindingKind::Sampler => KilnNativeDescriptor::DefaultSampler,
        }
    }
}

pub struct KilnBindGroupLayoutInner {
    device_context: KilnDeviceContext,
    key: KilnObjectKey,
    layout: KilnNativeBindGroupLayout,
    bind_group_layout_def: KilnBindGroupLayoutDef,
    slots: FnvHashMap<u32, KilnBindingSlot>,
    resource_table_size: u32,
    sampler_table_size: u32,
    resource_table_visibility: KilnShaderStageFlags,
    sampler_table_visibility: KilnShaderStageFlags,
}

impl Drop for KilnBindGroupLayoutInner {
    fn drop(&mut self) {
        self.device_context.retire(KilnRetiredItem::Object(self.key));
    }
}

/// Describes the slots of a bind group. Resource slots and sampler slots are each packed into one
/// contiguous descriptor table, in entry order.
#[derive(Clone)]
pub struct KilnBindGroupLayout {
    inner: Arc<KilnBindGroupLayoutInner>,
}

impl std::fmt::Debug for KilnBindGroupLayout {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("KilnBindGroupLayout")
            .field("layout", &self.inner.layout)
            .field("resource_table_size", &self.inner.resource_table_size)
            .field("sampler_table_size", &self.inner.sampler_table_size)
            .finish()
    }
}

impl PartialEq for KilnBindGroupLayout {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for KilnBindGroupLayout {}

impl KilnBindGroupLayout {
    pub(crate) fn new(
        device_context: &KilnDeviceContext,
        bind_group_layout_def: &KilnBindGroupLayoutDef,
    ) -> KilnResult<Self> {
        device_context.check_lost()?;
        bind_group_layout_def.verify()?;

        let mut slots = FnvHashMap::default();
        let mut resource_table_size = 0;
        let mut sampler_table_size = 0;
        let mut resource_table_visibility = KilnShaderStageFlags::NONE;
        let mut sampler_table_visibility = KilnShaderStageFlags::NONE;
        for entry in &bind_group_layout_def.entries {
            let (heap_type, table_size, visibility) = if entry.kind.is_sampler() {
                (
                    KilnDescriptorHeapType::Sampler,
                    &mut sampler_table_size,
                    &mut sampler_table_visibility,
                )
            } else {
                (
                    KilnDescriptorHeapType::Resource,
                    &mut resource_table_size,
                    &mut resource_table_visibility,
                )
            };

            slots.insert(
                entry.binding,
                KilnBindingSlot {
                    kind: entry.kind,
                    heap_type,
                    table_offset: *table_size,
                    count: entry.count,
                },
            );
            *table_size += entry.count;
            *visibility |= entry.visibility;
        }

        let layout = device_context
            .create_native(|native| native.create_bind_group_layout(bind_group_layout_def))?;
        let key = device_context.register_object(layout.into());

        let inner = KilnBindGroupLayoutInner {
            device_context: device_context.clone(),
            key,
            layout,
            bind_group_layout_def: bind_group_layout_def.clone(),
            slots,
            resource_table_size,
            sampler_table_size,
            resource_table_visibility,
            sampler_table_visibility,
        };

        Ok(KilnBindGroupLayout {
            inner: Arc::new(inner),
        })
    }

    pub fn bind_group_layout_def(&self) -> &KilnBindGroupLayoutDef {
        &self.inner.bind_group_layout_def
    }

    pub fn native_bind_group_layout(&self) -> KilnNativeBindGroupLayout {
        self.inner.layout
    }

    pub fn resource_table_size(&self) -> u32 {
        self.inner.resource_table_size
    }

    pub fn sampler_table_size(&self) -> u32 {
        self.inner.sampler_table_size
    }

    pub fn resource_table_visibility(&self) -> KilnShaderStageFlags {
        self.inner.resource_table_visibility
    }

    pub fn sampler_table_visibility(&self) -> KilnShaderStageFlags {
        self.inner.sampler_table_visibility
    }

    pub fn slot(
        &self,
        binding: u32,
    ) -> Option<KilnBindingSlot> {
        self.inner.slots.get(&binding).copied()
    }

    /// Slots in entry order
    pub fn slots(&self) -> impl Iterator<Item = (u32, KilnBindingSlot)> + '_ {
        self.inner
            .bind_group_layout_def
            .entries
            .iter()
            .filter_map(move |entry| self.slot(entry.binding).map(|slot| (entry.binding, slot)))
    }

    /// Check that every entry names a binding of this layout, with a matching kind and an array
    /// element inside the binding's count
    pub fn verify_entries(
        &self,
        entries: &[KilnBindGroupEntry],
    ) -> KilnResult<()> {
        let mut seen = fnv::FnvHashSet::default();
        for entry in entries {
            let slot = self.slot(entry.binding).ok_or_else(|| {
                KilnError::ValidationError(format!(
                    "Binding {} does not exist in the layout",
                    entry.binding
                ))
            })?;

            let kind = entry.resource.kind();
            if kind != slot.kind {
                return Err(KilnError::ValidationError(format!(
                    "Binding {} expects {:?}, got {:?}",
                    entry.binding, slot.kind, kind
                )));
            }

            if entry.array_element >= slot.count {
                return Err(KilnError::ValidationError(format!(
                    "Array element {} is out of range for binding {} with count {}",
                    entry.array_element, entry.binding, slot.count
                )));
            }

            if !seen.insert((entry.binding, entry.array_element)) {
                return Err(KilnError::ValidationError(format!(
                    "Binding {} element {} is bound more than once",
                    entry.binding, entry.array_element
                )));
            }
        }

        Ok(())
    }
}
