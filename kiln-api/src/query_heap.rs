use crate::backends::KilnNativeQueryHeap;
use crate::device_context::{KilnObjectKey, KilnRetiredItem};
use crate::*;
use std::sync::Arc;

pub struct KilnQueryHeapInner {
    device_context: KilnDeviceContext,
    key: KilnObjectKey,
    query_heap: KilnNativeQueryHeap,
    query_heap_def: KilnQueryHeapDef,
}

impl Drop for KilnQueryHeapInner {
    fn drop(&mut self) {
        self.device_context.retire(KilnRetiredItem::Object(self.key));
    }
}

/// A fixed-size array of GPU queries of a single type
#[derive(Clone)]
pub struct KilnQueryHeap {
    inner: Arc<KilnQueryHeapInner>,
}

impl std::fmt::Debug for KilnQueryHeap {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("KilnQueryHeap")
            .field("query_heap", &self.inner.query_heap)
            .field("query_heap_def", &self.inner.query_heap_def)
            .finish()
    }
}

impl KilnQueryHeap {
    pub(crate) fn new(
        device_context: &KilnDeviceContext,
        query_heap_def: &KilnQueryHeapDef,
    ) -> KilnResult<Self> {
        device_context.check_lost()?;
        query_heap_def.verify()?;

        if let Some(feature) = query_heap_def.query_type.required_feature() {
            if !device_context.native().supports_feature(feature) {
                return Err(KilnError::ValidationError(format!(
                    "{:?} queries require {:?}",
                    query_heap_def.query_type, feature
                )));
            }
        }

        let query_heap =
            device_context.create_native(|native| native.create_query_heap(query_heap_def))?;
        let key = device_context.register_object(query_heap.into());

        let inner = KilnQueryHeapInner {
            device_context: device_context.clone(),
            key,
            query_heap,
            query_heap_def: query_heap_def.clone(),
        };

        Ok(KilnQueryHeap {
            inner: Arc::new(inner),
        })
    }

    pub fn native_query_heap(&self) -> KilnNativeQueryHeap {
        self.inner.query_heap
    }

    pub fn query_type(&self) -> KilnQueryType {
        self.inner.query_heap_def.query_type
    }

    pub fn count(&self) -> u32 {
        self.inner.query_heap_def.count
    }

    pub(crate) fn check_range(
        &self,
        first_query: u32,
        query_count: u32,
    ) -> KilnResult<()> {
        let end = first_query.checked_add(query_count);
        if query_count == 0 || end.map(|end| end > self.count()).unwrap_or(true) {
            return Err(KilnError::ValidationError(format!(
                "Queries {}..+{} are outside of a heap of {}",
                first_query,
                query_count,
                self.count()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_queries_require_feature() {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = KilnDevice::new(&KilnDeviceDef {
            null: KilnNullDeviceDef {
                features: vec![],
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();

        let result = device.create_query_heap(&KilnQueryHeapDef {
            query_type: KilnQueryType::Timestamp,
            count: 16,
            label: None,
        });
        assert!(matches!(result, Err(KilnError::ValidationError(_))));

        let query_heap = device
            .create_query_heap(&KilnQueryHeapDef {
                query_type: KilnQueryType::Occlusion,
                count: 16,
                label: None,
            })
            .unwrap();
        assert!(query_heap.check_range(15, 1).is_ok());
        assert!(query_heap.check_range(15, 2).is_err());
        assert!(query_heap.check_range(0, 0).is_err());
    }
}
