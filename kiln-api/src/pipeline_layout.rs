use crate::backends::{
    KilnNativeRootParameter, KilnNativeRootSignature, KilnNativeRootSignatureDesc,
};
use crate::device_context::{KilnObjectKey, KilnRetiredItem};
use crate::*;
use std::sync::Arc;

/// Root parameter indices of one bind group's tables
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct KilnBindGroupRootIndices {
    pub resource_table: Option<u32>,
    pub sampler_table: Option<u32>,
}

pub struct KilnPipelineLayoutInner {
    device_context: KilnDeviceContext,
    key: KilnObjectKey,
    root_signature: KilnNativeRootSignature,
    bind_group_layouts: Vec<KilnBindGroupLayout>,
    root_indices: Vec<KilnBindGroupRootIndices>,
    push_constant_root_index: Option<u32>,
    push_constant_size: u32,
}

impl Drop for KilnPipelineLayoutInner {
    fn drop(&mut self) {
        self.device_context.retire(KilnRetiredItem::Object(self.key));
    }
}

/// The bind group layouts and push constants a pipeline is built against. Bind group `i` binds its
/// resource table and then its sampler table; push constants come last.
#[derive(Clone)]
pub struct KilnPipelineLayout {
    inner: Arc<KilnPipelineLayoutInner>,
}

impl std::fmt::Debug for KilnPipelineLayout {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("KilnPipelineLayout")
            .field("root_signature", &self.inner.root_signature)
            .field("root_indices", &self.inner.root_indices)
            .finish()
    }
}

impl PartialEq for KilnPipelineLayout {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for KilnPipelineLayout {}

impl KilnPipelineLayout {
    pub(crate) fn new(
        device_context: &KilnDeviceContext,
        pipeline_layout_def: &KilnPipelineLayoutDef,
    ) -> KilnResult<Self> {
        device_context.check_lost()?;
        pipeline_layout_def.verify()?;

        let mut parameters = Vec::default();
        let mut root_indices = Vec::with_capacity(pipeline_layout_def.bind_group_layouts.len());
        for layout in &pipeline_layout_def.bind_group_layouts {
            let mut indices = KilnBindGroupRootIndices::default();
            if layout.resource_table_size() > 0 {
                indices.resource_table = Some(parameters.len() as u32);
                parameters.push(KilnNativeRootParameter::DescriptorTable {
                    heap_type: KilnDescriptorHeapType::Resource,
                    descriptor_count: layout.resource_table_size(),
                    visibility: layout.resource_table_visibility(),
                });
            }

            if layout.sampler_table_size() > 0 {
                indices.sampler_table = Some(parameters.len() as u32);
                parameters.push(KilnNativeRootParameter::DescriptorTable {
                    heap_type: KilnDescriptorHeapType::Sampler,
                    descriptor_count: layout.sampler_table_size(),
                    visibility: layout.sampler_table_visibility(),
                });
            }

            root_indices.push(indices);
        }

        let push_constant_root_index = if pipeline_layout_def.push_constant_size > 0 {
            parameters.push(KilnNativeRootParameter::Constants {
                size_in_bytes: pipeline_layout_def.push_constant_size,
            });
            Some(parameters.len() as u32 - 1)
        } else {
            None
        };

        let desc = KilnNativeRootSignatureDesc { parameters };
        let root_signature =
            device_context.create_native(|native| native.create_root_signature(&desc))?;
        let key = device_context.register_object(root_signature.into());

        let inner = KilnPipelineLayoutInner {
            device_context: device_context.clone(),
            key,
            root_signature,
            bind_group_layouts: pipeline_layout_def.bind_group_layouts.clone(),
            root_indices,
            push_constant_root_index,
            push_constant_size: pipeline_layout_def.push_constant_size,
        };

        Ok(KilnPipelineLayout {
            inner: Arc::new(inner),
        })
    }

    pub fn native_root_signature(&self) -> KilnNativeRootSignature {
        self.inner.root_signature
    }

    pub fn bind_group_layouts(&self) -> &[KilnBindGroupLayout] {
        &self.inner.bind_group_layouts
    }

    pub fn bind_group_layout(
        &self,
        index: u32,
    ) -> Option<&KilnBindGroupLayout> {
        self.inner.bind_group_layouts.get(index as usize)
    }

    pub fn root_indices(
        &self,
        index: u32,
    ) -> Option<KilnBindGroupRootIndices> {
        self.inner.root_indices.get(index as usize).copied()
    }

    pub fn push_constant_root_index(&self) -> Option<u32> {
        self.inner.push_constant_root_index
    }

    pub fn push_constant_size(&self) -> u32 {
        self.inner.push_constant_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_parameter_order() {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = KilnDevice::new(&Default::default()).unwrap();
        let textures_only = device
            .create_bind_group_layout(&KilnBindGroupLayoutDef {
                entries: vec![KilnBindGroupLayoutEntry::new(
                    0,
                    KilnBindingKind::Texture,
                    KilnShaderStageFlags::FRAGMENT,
                )],
                label: None,
            })
            .unwrap();
        let mixed = device
            .create_bind_group_layout(&KilnBindGroupLayoutDef {
                entries: vec![
                    KilnBindGroupLayoutEntry::new(
                        0,
                        KilnBindingKind::Sampler,
                        KilnShaderStageFlags::FRAGMENT,
                    ),
                    KilnBindGroupLayoutEntry::new(
                        1,
                        KilnBindingKind::ConstantBuffer,
                        KilnShaderStageFlags::VERTEX,
                    ),
                ],
                label: None,
            })
            .unwrap();

        let layout = device
            .create_pipeline_layout(&KilnPipelineLayoutDef {
                bind_group_layouts: vec![textures_only, mixed],
                push_constant_size: 16,
                label: None,
            })
            .unwrap();

        assert_eq!(
            layout.root_indices(0),
            Some(KilnBindGroupRootIndices {
                resource_table: Some(0),
                sampler_table: None,
            })
        );
        assert_eq!(
            layout.root_indices(1),
            Some(KilnBindGroupRootIndices {
                resource_table: Some(1),
                sampler_table: Some(2),
            })
        );
        assert_eq!(layout.push_constant_root_index(), Some(3));
        assert_eq!(layout.root_indices(2), None);
    }

    #[test]
    fn test_too_many_bind_groups() {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = KilnDevice::new(&Default::default()).unwrap();
        let bind_group_layout = device
            .create_bind_group_layout(&Default::default())
            .unwrap();

        let result = device.create_pipeline_layout(&KilnPipelineLayoutDef {
            bind_group_layouts: vec![bind_group_layout; crate::MAX_BIND_GROUPS + 1],
            ..Default::default()
        });
        assert!(matches!(result, Err(KilnError::ValidationError(_))));
    }
}
