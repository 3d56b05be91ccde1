use crate::backends::KilnNativePipeline;
use crate::device_context::{KilnObjectKey, KilnRetiredItem};
use crate::*;
use std::sync::Arc;

struct KilnPipelineObject {
    device_context: KilnDeviceContext,
    key: KilnObjectKey,
    pipeline: KilnNativePipeline,
}

impl Drop for KilnPipelineObject {
    fn drop(&mut self) {
        self.device_context.retire(KilnRetiredItem::Object(self.key));
    }
}

pub struct KilnRenderPipelineInner {
    object: KilnPipelineObject,
    pipeline_def: KilnRenderPipelineDef,
}

#[derive(Clone)]
pub struct KilnRenderPipeline {
    inner: Arc<KilnRenderPipelineInner>,
}

impl std::fmt::Debug for KilnRenderPipeline {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("KilnRenderPipeline")
            .field("pipeline", &self.inner.object.pipeline)
            .field("label", &self.inner.pipeline_def.label)
            .finish()
    }
}

impl PartialEq for KilnRenderPipeline {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn require_format_support(
    device_context: &KilnDeviceContext,
    format: KilnFormat,
    required: KilnFormatSupport,
) -> KilnResult<()> {
    if !device_context.native().format_support(format).contains(required) {
        return Err(KilnError::ValidationError(format!(
            "Format {:?} does not support {:?}",
            format, required
        )));
    }

    Ok(())
}

impl KilnRenderPipeline {
    pub(crate) fn new(
        device_context: &KilnDeviceContext,
        pipeline_def: &KilnRenderPipelineDef,
    ) -> KilnResult<Self> {
        device_context.check_lost()?;
        pipeline_def.verify(
            device_context
                .native()
                .supports_feature(KilnFeature::MeshShader),
        )?;

        for format in &pipeline_def.color_formats {
            require_format_support(device_context, *format, KilnFormatSupport::RENDER_TARGET)?;
        }

        if !pipeline_def.depth_stencil_format.is_undefined() {
            require_format_support(
                device_context,
                pipeline_def.depth_stencil_format,
                KilnFormatSupport::DEPTH_STENCIL,
            )?;
        }

        for vertex_buffer in &pipeline_def.vertex_buffers {
            for attribute in &vertex_buffer.attributes {
                require_format_support(
                    device_context,
                    attribute.format,
                    KilnFormatSupport::VERTEX_BUFFER,
                )?;
            }
        }

        let root_signature = pipeline_def.layout.native_root_signature();
        let pipeline = device_context
            .create_native(|native| native.create_render_pipeline(root_signature, pipeline_def))?;
        let key = device_context.register_object(pipeline.into());

        let inner = KilnRenderPipelineInner {
            object: KilnPipelineObject {
                device_context: device_context.clone(),
                key,
                pipeline,
            },
            pipeline_def: pipeline_def.clone(),
        };

        Ok(KilnRenderPipeline {
            inner: Arc::new(inner),
        })
    }

    pub fn native_pipeline(&self) -> KilnNativePipeline {
        self.inner.object.pipeline
    }

    pub fn pipeline_def(&self) -> &KilnRenderPipelineDef {
        &self.inner.pipeline_def
    }

    pub fn layout(&self) -> &KilnPipelineLayout {
        &self.inner.pipeline_def.layout
    }

    pub fn primitive_topology(&self) -> KilnPrimitiveTopology {
        self.inner.pipeline_def.primitive_topology
    }

    pub fn vertex_buffer_stride(
        &self,
        slot: u32,
    ) -> Option<u32> {
        self.inner
            .pipeline_def
            .vertex_buffers
            .get(slot as usize)
            .map(|x| x.stride)
    }
}

pub struct KilnComputePipelineInner {
    object: KilnPipelineObject,
    pipeline_def: KilnComputePipelineDef,
}

#[derive(Clone)]
pub struct KilnComputePipeline {
    inner: Arc<KilnComputePipelineInner>,
}

impl std::fmt::Debug for KilnComputePipeline {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("KilnComputePipeline")
            .field("pipeline", &self.inner.object.pipeline)
            .field("label", &self.inner.pipeline_def.label)
            .finish()
    }
}

impl PartialEq for KilnComputePipeline {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl KilnComputePipeline {
    pub(crate) fn new(
        device_context: &KilnDeviceContext,
        pipeline_def: &KilnComputePipelineDef,
    ) -> KilnResult<Self> {
        device_context.check_lost()?;
        pipeline_def.verify()?;

        let root_signature = pipeline_def.layout.native_root_signature();
        let pipeline = device_context
            .create_native(|native| native.create_compute_pipeline(root_signature, pipeline_def))?;
        let key = device_context.register_object(pipeline.into());

        let inner = KilnComputePipelineInner {
            object: KilnPipelineObject {
                device_context: device_context.clone(),
                key,
                pipeline,
            },
            pipeline_def: pipeline_def.clone(),
        };

        Ok(KilnComputePipeline {
            inner: Arc::new(inner),
        })
    }

    pub fn native_pipeline(&self) -> KilnNativePipeline {
        self.inner.object.pipeline
    }

    pub fn pipeline_def(&self) -> &KilnComputePipelineDef {
        &self.inner.pipeline_def
    }

    pub fn layout(&self) -> &KilnPipelineLayout {
        &self.inner.pipeline_def.layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shader(stage: KilnShaderStageFlags) -> KilnShaderStageDef {
        KilnShaderStageDef {
            stage,
            bytecode: vec![0x44, 0x58, 0x42, 0x43],
            entry_point: "main".to_string(),
        }
    }

    #[test]
    fn test_mesh_pipeline_requires_feature() {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = KilnDevice::new(&Default::default()).unwrap();
        let layout = device.create_pipeline_layout(&Default::default()).unwrap();

        let mut def = KilnRenderPipelineDef {
            layout,
            vertex: None,
            mesh: Some(shader(KilnShaderStageFlags::MESH)),
            fragment: Some(shader(KilnShaderStageFlags::FRAGMENT)),
            vertex_buffers: vec![],
            primitive_topology: KilnPrimitiveTopology::TriangleList,
            color_formats: vec![KilnFormat::R8G8B8A8Unorm],
            depth_stencil_format: KilnFormat::D32Float,
            sample_count: KilnSampleCount::SampleCount1,
            label: None,
        };
        assert!(matches!(
            device.create_render_pipeline(&def),
            Err(KilnError::ValidationError(_))
        ));

        def.mesh = None;
        def.vertex = Some(shader(KilnShaderStageFlags::VERTEX));
        let pipeline = device.create_render_pipeline(&def).unwrap();
        assert_eq!(
            pipeline.primitive_topology(),
            KilnPrimitiveTopology::TriangleList
        );
    }

    #[test]
    fn test_render_pipeline_attachment_limits() {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = KilnDevice::new(&Default::default()).unwrap();
        let layout = device.create_pipeline_layout(&Default::default()).unwrap();

        let result = device.create_render_pipeline(&KilnRenderPipelineDef {
            layout: layout.clone(),
            vertex: Some(shader(KilnShaderStageFlags::VERTEX)),
            mesh: None,
            fragment: None,
            vertex_buffers: vec![],
            primitive_topology: KilnPrimitiveTopology::TriangleList,
            color_formats: vec![KilnFormat::R8G8B8A8Unorm; crate::MAX_COLOR_ATTACHMENTS + 1],
            depth_stencil_format: KilnFormat::Undefined,
            sample_count: KilnSampleCount::SampleCount1,
            label: None,
        });
        assert!(matches!(result, Err(KilnError::ValidationError(_))));

        // Compressed formats cannot be rendered to
        let result = device.create_render_pipeline(&KilnRenderPipelineDef {
            layout,
            vertex: Some(shader(KilnShaderStageFlags::VERTEX)),
            mesh: None,
            fragment: None,
            vertex_buffers: vec![],
            primitive_topology: KilnPrimitiveTopology::TriangleList,
            color_formats: vec![KilnFormat::Bc7RgbaUnorm],
            depth_stencil_format: KilnFormat::Undefined,
            sample_count: KilnSampleCount::SampleCount1,
            label: None,
        });
        assert!(matches!(result, Err(KilnError::ValidationError(_))));
    }

    #[test]
    fn test_compute_pipeline_stage_must_match() {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = KilnDevice::new(&Default::default()).unwrap();
        let layout = device.create_pipeline_layout(&Default::default()).unwrap();

        let result = device.create_compute_pipeline(&KilnComputePipelineDef {
            layout: layout.clone(),
            compute: shader(KilnShaderStageFlags::VERTEX),
            label: None,
        });
        assert!(matches!(result, Err(KilnError::ValidationError(_))));

        let pipeline = device
            .create_compute_pipeline(&KilnComputePipelineDef {
                layout: layout.clone(),
                compute: shader(KilnShaderStageFlags::COMPUTE),
                label: None,
            })
            .unwrap();
        assert_eq!(pipeline.layout(), &layout);
    }
}
