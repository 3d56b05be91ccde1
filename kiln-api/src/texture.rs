use crate::backends::{KilnNativeDescriptor, KilnNativeResource};
use crate::device_context::{KilnObjectKey, KilnRetiredItem};
use crate::*;
use fnv::FnvHashMap;
use std::sync::{Arc, Mutex, MutexGuard};

fn view_key(
    mip_level: u32,
    array_layer: u32,
    format: KilnFormat,
    read_only: bool,
) -> u64 {
    (mip_level as u64 & 0xFFFF)
        | ((array_layer as u64 & 0xFFFF) << 16)
        | ((format as u64 & 0xFFFF) << 32)
        | ((read_only as u64) << 48)
}

#[derive(Copy, Clone, Debug)]
struct CachedView {
    heap: KilnDescriptorHeapType,
    index: u32,
}

pub struct KilnTextureInner {
    device_context: KilnDeviceContext,
    // None for swap chain back buffers, which the swap chain destroys
    key: Option<KilnObjectKey>,
    resource: KilnNativeResource,
    texture_def: KilnTextureDef,
    layouts: Mutex<Vec<KilnTrackedState<KilnTextureLayout>>>,
    views: Mutex<FnvHashMap<u64, CachedView>>,
}

impl Drop for KilnTextureInner {
    fn drop(&mut self) {
        for (_, view) in self.views.lock().unwrap().drain() {
            self.device_context
                .retire(KilnRetiredItem::ViewDescriptor {
                    heap: view.heap,
                    index: view.index,
                });
        }

        if let Some(key) = self.key {
            self.device_context.retire(KilnRetiredItem::Object(key));
        }
    }
}

/// A GPU texture. Clones share the same texture; it is retired when the last clone is dropped.
#[derive(Clone)]
pub struct KilnTexture {
    inner: Arc<KilnTextureInner>,
}

impl std::fmt::Debug for KilnTexture {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("KilnTexture")
            .field("resource", &self.inner.resource)
            .field("texture_def", &self.inner.texture_def)
            .finish()
    }
}

impl PartialEq for KilnTexture {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for KilnTexture {}

impl KilnTexture {
    /// Layout a texture starts in when it is created without initial data
    pub fn initial_layout(texture_def: &KilnTextureDef) -> KilnTextureLayout {
        let usage = texture_def.usage;
        if usage.contains(KilnTextureUsage::RENDER_TARGET) {
            if texture_def.format.is_depth_stencil() {
                KilnTextureLayout::DepthWrite
            } else {
                KilnTextureLayout::RenderTarget
            }
        } else if usage.contains(KilnTextureUsage::SHADER_WRITE) {
            KilnTextureLayout::UnorderedAccess
        } else if usage.contains(KilnTextureUsage::SHADER_READ) {
            KilnTextureLayout::ShaderResource
        } else {
            KilnTextureLayout::Undefined
        }
    }

    fn verify_format_support(
        device_context: &KilnDeviceContext,
        texture_def: &KilnTextureDef,
    ) -> KilnResult<()> {
        let support = device_context.native().format_support(texture_def.format);
        let mut required = KilnFormatSupport::NONE;
        if texture_def.usage.contains(KilnTextureUsage::SHADER_READ) {
            required |= KilnFormatSupport::SHADER_READ;
        }
        if texture_def.usage.contains(KilnTextureUsage::SHADER_WRITE) {
            required |= KilnFormatSupport::SHADER_WRITE;
        }
        if texture_def.usage.contains(KilnTextureUsage::RENDER_TARGET) {
            if texture_def.format.is_depth_stencil() {
                required |= KilnFormatSupport::DEPTH_STENCIL;
            } else {
                required |= KilnFormatSupport::RENDER_TARGET;
            }
        }
        if texture_def.sample_count != KilnSampleCount::SampleCount1 {
            required |= KilnFormatSupport::MULTISAMPLE;
        }

        if !support.contains(required) {
            return Err(KilnError::ValidationError(format!(
                "Format {:?} does not support {:?}",
                texture_def.format,
                required - support
            )));
        }

        Ok(())
    }

    pub(crate) fn new(
        device_context: &KilnDeviceContext,
        texture_def: &KilnTextureDef,
    ) -> KilnResult<Self> {
        Self::new_with_layout(device_context, texture_def, Self::initial_layout(texture_def))
    }

    pub(crate) fn new_with_layout(
        device_context: &KilnDeviceContext,
        texture_def: &KilnTextureDef,
        initial_layout: KilnTextureLayout,
    ) -> KilnResult<Self> {
        device_context.check_lost()?;
        texture_def.verify()?;
        Self::verify_format_support(device_context, texture_def)?;

        let resource = device_context.create_native(|native| {
            native.create_texture(
                texture_def,
                initial_layout.to_resource_state(KilnQueueType::Graphics),
            )
        })?;
        let key = device_context.register_object(resource.into());

        log::trace!(
            "Created texture {:?} {:?} in {:?}",
            resource,
            texture_def.label,
            initial_layout
        );

        Ok(Self::from_parts(
            device_context,
            Some(key),
            resource,
            texture_def.clone(),
            initial_layout,
        ))
    }

    /// Wrap a back buffer owned by a swap chain. Back buffers start in `Present`.
    pub(crate) fn from_back_buffer(
        device_context: &KilnDeviceContext,
        resource: KilnNativeResource,
        texture_def: KilnTextureDef,
    ) -> Self {
        Self::from_parts(
            device_context,
            None,
            resource,
            texture_def,
            KilnTextureLayout::Present,
        )
    }

    fn from_parts(
        device_context: &KilnDeviceContext,
        key: Option<KilnObjectKey>,
        resource: KilnNativeResource,
        texture_def: KilnTextureDef,
        initial_layout: KilnTextureLayout,
    ) -> Self {
        let initial_state = KilnTrackedState::new(
            initial_layout,
            initial_layout.to_resource_state(KilnQueueType::Graphics),
        );
        let layouts = vec![initial_state; texture_def.subresource_count() as usize];
        let inner = KilnTextureInner {
            device_context: device_context.clone(),
            key,
            resource,
            texture_def,
            layouts: Mutex::new(layouts),
            views: Default::default(),
        };

        KilnTexture {
            inner: Arc::new(inner),
        }
    }

    pub fn texture_def(&self) -> &KilnTextureDef {
        &self.inner.texture_def
    }

    pub fn native_resource(&self) -> KilnNativeResource {
        self.inner.resource
    }

    pub fn key(&self) -> Option<KilnObjectKey> {
        self.inner.key
    }

    pub fn is_back_buffer(&self) -> bool {
        self.inner.key.is_none()
    }

    pub(crate) fn layouts(&self) -> MutexGuard<Vec<KilnTrackedState<KilnTextureLayout>>> {
        self.inner.layouts.lock().unwrap()
    }

    /// Tracked layout of every subresource, indexed by `KilnTextureDef::subresource_index`
    pub fn subresource_layouts(&self) -> Vec<KilnTextureLayout> {
        self.layouts().iter().map(|x| x.requested).collect()
    }

    pub fn subresource_layout(
        &self,
        mip_level: u32,
        array_layer: u32,
    ) -> Option<KilnTextureLayout> {
        let index = self.inner.texture_def.subresource_index(mip_level, array_layer);
        self.layouts().get(index as usize).map(|x| x.requested)
    }

    /// Overwrite the tracked layout of every subresource without recording a barrier. For
    /// resources whose layout was changed outside of this device's tracking.
    pub fn set_layout(
        &self,
        layout: KilnTextureLayout,
    ) {
        let tracked =
            KilnTrackedState::new(layout, layout.to_resource_state(KilnQueueType::Graphics));
        for x in self.layouts().iter_mut() {
            *x = tracked;
        }
    }

    pub(crate) fn shader_resource_descriptor(&self) -> KilnNativeDescriptor {
        KilnNativeDescriptor::TextureShaderResourceView {
            resource: self.inner.resource,
            format: self.inner.texture_def.format,
            dimension: self.inner.texture_def.dimension,
            mip_count: self.inner.texture_def.mip_count,
        }
    }

    pub(crate) fn unordered_access_descriptor(
        &self,
        mip_level: u32,
    ) -> KilnNativeDescriptor {
        KilnNativeDescriptor::TextureUnorderedAccessView {
            resource: self.inner.resource,
            format: self.inner.texture_def.format,
            mip_level,
        }
    }

    fn cached_view(
        &self,
        heap: KilnDescriptorHeapType,
        key: u64,
        descriptor: KilnNativeDescriptor,
    ) -> KilnResult<u32> {
        let mut views = self.inner.views.lock().unwrap();
        if let Some(view) = views.get(&key) {
            return Ok(view.index);
        }

        let allocator = self
            .inner
            .device_context
            .view_descriptor_allocator(heap)
            .ok_or_else(|| KilnError::StringError(format!("{:?} is not a view heap", heap)))?;
        let index = allocator.allocate(&descriptor)?;
        views.insert(key, CachedView { heap, index });
        Ok(index)
    }

    fn check_subresource(
        &self,
        mip_level: u32,
        array_layer: u32,
    ) -> KilnResult<()> {
        let texture_def = &self.inner.texture_def;
        if mip_level >= texture_def.mip_count || array_layer >= texture_def.array_layer_count() {
            return Err(KilnError::ValidationError(format!(
                "Subresource mip {} layer {} is out of range for texture {:?}",
                mip_level, array_layer, texture_def.label
            )));
        }

        Ok(())
    }

    /// Render target view for one subresource, created on first use
    pub fn render_target_view(
        &self,
        mip_level: u32,
        array_layer: u32,
    ) -> KilnResult<u32> {
        self.check_subresource(mip_level, array_layer)?;
        let format = self.inner.texture_def.format;
        if format.is_depth_stencil() {
            return Err(KilnError::ValidationError(format!(
                "{:?} cannot be used as a render target view",
                format
            )));
        }

        self.cached_view(
            KilnDescriptorHeapType::RenderTarget,
            view_key(mip_level, array_layer, format, false),
            KilnNativeDescriptor::RenderTargetView {
                resource: self.inner.resource,
                format,
                mip_level,
                array_layer,
            },
        )
    }

    /// Depth/stencil view for one subresource, created on first use
    pub fn depth_stencil_view(
        &self,
        mip_level: u32,
        array_layer: u32,
        read_only: bool,
    ) -> KilnResult<u32> {
        self.check_subresource(mip_level, array_layer)?;
        let format = self.inner.texture_def.format;
        if !format.is_depth_stencil() {
            return Err(KilnError::ValidationError(format!(
                "{:?} cannot be used as a depth/stencil view",
                format
            )));
        }

        self.cached_view(
            KilnDescriptorHeapType::DepthStencil,
            view_key(mip_level, array_layer, format, read_only),
            KilnNativeDescriptor::DepthStencilView {
                resource: self.inner.resource,
                format,
                mip_level,
                array_layer,
                read_only,
            },
        )
    }

    pub fn cached_view_count(&self) -> usize {
        self.inner.views.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_device() -> KilnDevice {
        let _ = env_logger::builder().is_test(true).try_init();
        KilnDevice::new(&Default::default()).unwrap()
    }

    fn texture_def(
        format: KilnFormat,
        usage: KilnTextureUsage,
    ) -> KilnTextureDef {
        KilnTextureDef {
            format,
            extents: KilnExtents3D {
                width: 32,
                height: 32,
                depth_or_array_layers: 1,
            },
            usage,
            ..Default::default()
        }
    }

    #[test]
    fn test_initial_layouts() {
        let device = create_device();
        let cases = [
            (
                KilnFormat::D32Float,
                KilnTextureUsage::RENDER_TARGET,
                KilnTextureLayout::DepthWrite,
            ),
            (
                KilnFormat::R8G8B8A8Unorm,
                KilnTextureUsage::RENDER_TARGET | KilnTextureUsage::SHADER_READ,
                KilnTextureLayout::RenderTarget,
            ),
            (
                KilnFormat::R8G8B8A8Unorm,
                KilnTextureUsage::SHADER_WRITE | KilnTextureUsage::SHADER_READ,
                KilnTextureLayout::UnorderedAccess,
            ),
            (
                KilnFormat::R8G8B8A8Unorm,
                KilnTextureUsage::SHADER_READ,
                KilnTextureLayout::ShaderResource,
            ),
            (
                KilnFormat::R8G8B8A8Unorm,
                KilnTextureUsage::NONE,
                KilnTextureLayout::Undefined,
            ),
        ];

        for (format, usage, expected) in cases.iter() {
            let texture = device.create_texture(&texture_def(*format, *usage)).unwrap();
            assert_eq!(texture.subresource_layouts(), vec![*expected]);
        }
    }

    #[test]
    fn test_view_cache() {
        let device = create_device();
        let texture = device
            .create_texture(&texture_def(
                KilnFormat::R8G8B8A8Unorm,
                KilnTextureUsage::RENDER_TARGET,
            ))
            .unwrap();

        let a = texture.render_target_view(0, 0).unwrap();
        let b = texture.render_target_view(0, 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(texture.cached_view_count(), 1);
        assert!(texture.render_target_view(1, 0).is_err());
        assert!(texture.depth_stencil_view(0, 0, false).is_err());

        let allocator = device
            .device_context()
            .view_descriptor_allocator(KilnDescriptorHeapType::RenderTarget)
            .unwrap();
        assert_eq!(allocator.allocated_count(), 1);

        drop(texture);
        device.wait_idle().unwrap();
        assert_eq!(allocator.allocated_count(), 0);
    }

    #[test]
    fn test_unsupported_format_usage_is_rejected() {
        let device = create_device();
        let result = device.create_texture(&KilnTextureDef {
            format: KilnFormat::Bc1RgbaUnorm,
            extents: KilnExtents3D {
                width: 32,
                height: 32,
                depth_or_array_layers: 1,
            },
            usage: KilnTextureUsage::RENDER_TARGET,
            ..Default::default()
        });
        assert!(matches!(result, Err(KilnError::ValidationError(_))));
    }

    #[test]
    fn test_view_key_packs_fields() {
        let a = view_key(1, 2, KilnFormat::D32Float, false);
        let b = view_key(1, 2, KilnFormat::D32Float, true);
        let c = view_key(2, 1, KilnFormat::D32Float, false);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a & 0xFFFF, 1);
        assert_eq!((a >> 16) & 0xFFFF, 2);
    }
}
