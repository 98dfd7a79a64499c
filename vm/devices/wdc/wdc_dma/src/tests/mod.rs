// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod fault_tests;

use crate::DmaConfig;
use crate::DmaContext;
use crate::emulated::EmulatedConfig;
use crate::emulated::EmulatedService;
use crate::emulated::UserPages;
use crate::memory::MemoryBlock;
use std::sync::Arc;

const USER_VA: u64 = 0x7f12_3400_0000;

fn setup() -> (Arc<EmulatedService>, DmaContext) {
    setup_with(EmulatedConfig::default(), DmaConfig::default())
}

fn setup_with(config: EmulatedConfig, dma_config: DmaConfig) -> (Arc<EmulatedService>, DmaContext) {
    let service = Arc::new(EmulatedService::new(config).unwrap());
    let context = DmaContext::with_config(service.clone(), dma_config).unwrap();
    (service, context)
}

/// Page-aligned caller memory.
fn user_memory(len: usize) -> MemoryBlock {
    MemoryBlock::new(UserPages::new(USER_VA, len))
}
