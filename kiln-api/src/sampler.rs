use crate::backends::{KilnNativeDescriptor, KilnNativeSampler};
use crate::device_context::{KilnObjectKey, KilnRetiredItem};
use crate::*;
use std::sync::Arc;

pub struct KilnSamplerInner {
    device_context: KilnDeviceContext,
    key: KilnObjectKey,
    sampler: KilnNativeSampler,
    sampler_def: KilnSamplerDef,
}

impl Drop for KilnSamplerInner {
    fn drop(&mut self) {
        self.device_context.retire(KilnRetiredItem::Object(self.key));
    }
}

#[derive(Clone)]
pub struct KilnSampler {
    inner: Arc<KilnSamplerInner>,
}

impl std::fmt::Debug for KilnSampler {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("KilnSampler")
            .field("sampler", &self.inner.sampler)
            .finish()
    }
}

impl KilnSampler {
    pub(crate) fn new(
        device_context: &KilnDeviceContext,
        sampler_def: &KilnSamplerDef,
    ) -> KilnResult<Self> {
        device_context.check_lost()?;
        sampler_def.verify()?;

        match sampler_def.reduction {
            KilnSamplerReduction::Minimum | KilnSamplerReduction::Maximum => {
                if !device_context
                    .native()
                    .supports_feature(KilnFeature::SamplerMinMax)
                {
                    return Err(KilnError::ValidationError(format!(
                        "{:?} sampler reduction requires KilnFeature::SamplerMinMax",
                        sampler_def.reduction
                    )));
                }
            }
            KilnSamplerReduction::Comparison => {
                if sampler_def.compare_op.is_none() {
                    return Err(KilnError::ValidationError(
                        "Comparison samplers need a compare op".to_string(),
                    ));
                }
            }
            KilnSamplerReduction::Standard => {}
        }

        let sampler =
            device_context.create_native(|native| native.create_sampler(sampler_def))?;
        let key = device_context.register_object(sampler.into());

        let inner = KilnSamplerInner {
            device_context: device_context.clone(),
            key,
            sampler,
            sampler_def: sampler_def.clone(),
        };

        Ok(KilnSampler {
            inner: Arc::new(inner),
        })
    }

    pub fn sampler_def(&self) -> &KilnSamplerDef {
        &self.inner.sampler_def
    }

    pub fn native_sampler(&self) -> KilnNativeSampler {
        self.inner.sampler
    }

    pub(crate) fn descriptor(&self) -> KilnNativeDescriptor {
        KilnNativeDescriptor::Sampler(self.inner.sampler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_max_reduction_requires_feature() {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = KilnDevice::new(&KilnDeviceDef {
            null: KilnNullDeviceDef {
                features: vec![],
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();

        let result = device.create_sampler(&KilnSamplerDef {
            reduction: KilnSamplerReduction::Maximum,
            ..Default::default()
        });
        assert!(matches!(result, Err(KilnError::ValidationError(_))));
        assert!(device.create_sampler(&Default::default()).is_ok());
    }

    #[test]
    fn test_sampler_validation() {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = KilnDevice::new(&Default::default()).unwrap();

        for def in [
            KilnSamplerDef {
                max_anisotropy: 17,
                ..Default::default()
            },
            KilnSamplerDef {
                lod_min: 4.0,
                lod_max: 1.0,
                ..Default::default()
            },
            KilnSamplerDef {
                reduction: KilnSamplerReduction::Comparison,
                ..Default::default()
            },
        ]
        .iter()
        {
            assert!(matches!(
                device.create_sampler(def),
                Err(KilnError::ValidationError(_))
            ));
        }

        let sampler = device
            .create_sampler(&KilnSamplerDef {
                reduction: KilnSamplerReduction::Minimum,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            sampler.sampler_def().reduction,
            KilnSamplerReduction::Minimum
        );
    }
}
