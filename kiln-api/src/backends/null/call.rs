use crate::backends::KilnNativeCommand;
use crate::backends::KilnNativeDescriptor;

pub type NullObjectId = u64;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NullObjectKind {
    Queue,
    Fence,
    CommandAllocator,
    CommandList,
    Buffer,
    Texture,
    Sampler,
    BindGroupLayout,
    RootSignature,
    Pipeline,
    QueryHeap,
    DescriptorHeap,
    SwapChain,
    BackBuffer,
}

/// Every native call the null device receives, in order
#[derive(Clone, Debug, PartialEq)]
pub enum NullCall {
    CreateObject {
        id: NullObjectId,
        kind: NullObjectKind,
    },
    DestroyObject {
        id: NullObjectId,
        kind: NullObjectKind,
    },
    ResetCommandAllocator {
        allocator: NullObjectId,
    },
    ResetCommandList {
        command_list: NullObjectId,
        allocator: NullObjectId,
    },
    CloseCommandList {
        command_list: NullObjectId,
    },
    Record {
        command_list: NullObjectId,
        command: KilnNativeCommand,
    },
    ExecuteCommandLists {
        queue: NullObjectId,
        command_lists: Vec<NullObjectId>,
    },
    Signal {
        queue: NullObjectId,
        fence: NullObjectId,
        value: u64,
    },
    QueueWait {
        queue: NullObjectId,
        fence: NullObjectId,
        value: u64,
    },
    WaitForFence {
        fence: NullObjectId,
        value: u64,
    },
    WriteMapped {
        resource: NullObjectId,
        offset: u64,
        size: u64,
    },
    WriteDescriptor {
        heap: NullObjectId,
        index: u32,
        descriptor: KilnNativeDescriptor,
    },
    CopyDescriptors {
        dst_heap: NullObjectId,
        dst_index: u32,
        src_heap: NullObjectId,
        src_index: u32,
        count: u32,
    },
    ResizeSwapChain {
        swap_chain: NullObjectId,
        width: u32,
        height: u32,
    },
    Present {
        swap_chain: NullObjectId,
        sync_interval: u32,
    },
}

impl NullCall {
    /// The barrier batch size if this call recorded a barrier batch
    pub fn barrier_count(&self) -> Option<usize> {
        match self {
            NullCall::Record {
                command: KilnNativeCommand::ResourceBarriers(barriers),
                ..
            } => Some(barriers.len()),
            _ => None,
        }
    }

    pub fn recorded_command(&self) -> Option<&KilnNativeCommand> {
        match self {
            NullCall::Record { command, .. } => Some(command),
            _ => None,
        }
    }
}
