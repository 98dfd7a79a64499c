// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::AvalonError;
use crate::AvalonMmDma;
use crate::Descriptor;
use crate::DescriptorStatus;
use crate::MAX_TRANSFER_SIZE;
use crate::TransferDirection;
use crate::descriptor_offset;
use crate::registers;
use crate::status_offset;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use test_with_tracing::test;
use wdc_defs::CardHandle;
use wdc_defs::PAGE_SIZE;
use wdc_dma::DmaContext;
use wdc_dma::TransactionState;
use wdc_dma::device::DeviceRegisterIo;
use wdc_dma::emulated::EmulatedConfig;
use wdc_dma::emulated::EmulatedDevice;
use wdc_dma::emulated::EmulatedService;
use wdc_dma::emulated::UserPages;
use wdc_dma::memory::MemoryBlock;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

const USER_VA: u64 = 0x7f55_0000_0000;
const FPGA_OFFSET: u64 = 0x1000;

/// On-chip endpoint memory, as seen through BAR4.
struct EndpointMemory(Mutex<Vec<u8>>);

impl EndpointMemory {
    fn new(len: usize) -> Self {
        Self(Mutex::new(vec![0; len]))
    }
}

impl DeviceRegisterIo for EndpointMemory {
    fn len(&self) -> usize {
        self.0.lock().len()
    }

    fn read_u32(&self, offset: usize) -> u32 {
        u32::read_from_bytes(&self.0.lock()[offset..offset + 4]).unwrap()
    }

    fn read_u64(&self, offset: usize) -> u64 {
        u64::read_from_bytes(&self.0.lock()[offset..offset + 8]).unwrap()
    }

    fn write_u32(&self, offset: usize, data: u32) {
        self.0.lock()[offset..offset + 4].copy_from_slice(data.as_bytes());
    }

    fn write_u64(&self, offset: usize, data: u64) {
        self.0.lock()[offset..offset + 8].copy_from_slice(data.as_bytes());
    }
}

/// A descriptor controller that runs a table synchronously when its last
/// pointer is written.
struct EmulatedController {
    service: Arc<EmulatedService>,
    endpoint: Arc<EndpointMemory>,
    registers: Mutex<Vec<u32>>,
    starts: Mutex<Vec<(usize, u32)>>,
    stalled: bool,
}

impl EmulatedController {
    fn new(service: Arc<EmulatedService>, endpoint: Arc<EndpointMemory>) -> Self {
        Self {
            service,
            endpoint,
            registers: Mutex::new(vec![0; registers::CONTROL_SPACE_SIZE / 4]),
            starts: Mutex::new(Vec::new()),
            stalled: false,
        }
    }

    fn register(&self, offset: usize) -> u32 {
        self.registers.lock()[offset / 4]
    }

    fn run(&self, block: usize, last: usize) {
        let table = (u64::from(self.register(block + registers::DESCRIPTORS_HIGH)) << 32)
            | u64::from(self.register(block + registers::DESCRIPTORS_LOW));
        assert_eq!(self.register(block + registers::TABLE_SIZE) as usize, last);
        let fifo = match block {
            registers::TO_DEVICE_CONTROL => registers::ENDPOINT_READ_FIFO,
            _ => registers::ENDPOINT_WRITE_FIFO,
        };
        assert_eq!(self.register(block + registers::FIFO_LOW) as u64, fifo);

        let mut endpoint = self.endpoint.0.lock();
        for index in 0..=last {
            let mut bytes = [0; size_of::<Descriptor>()];
            self.service
                .device_read(table + descriptor_offset(index) as u64, &mut bytes)
                .unwrap();
            let descriptor = Descriptor::read_from_bytes(&bytes).unwrap();
            assert_eq!(descriptor.control.id() as usize, index);

            let len = descriptor.byte_count();
            if block == registers::TO_DEVICE_CONTROL {
                let dst = descriptor.dst() as usize;
                self.service
                    .device_read(descriptor.src(), &mut endpoint[dst..dst + len])
                    .unwrap();
            } else {
                let src = descriptor.src() as usize;
                self.service
                    .device_write(descriptor.dst(), &endpoint[src..src + len])
                    .unwrap();
            }
            self.service
                .device_write(
                    table + status_offset(index) as u64,
                    DescriptorStatus::new().with_done(true).as_bytes(),
                )
                .unwrap();
        }
    }
}

impl DeviceRegisterIo for EmulatedController {
    fn len(&self) -> usize {
        registers::CONTROL_SPACE_SIZE
    }

    fn read_u32(&self, offset: usize) -> u32 {
        self.register(offset)
    }

    fn read_u64(&self, offset: usize) -> u64 {
        (u64::from(self.register(offset + 4)) << 32) | u64::from(self.register(offset))
    }

    fn write_u32(&self, offset: usize, data: u32) {
        self.registers.lock()[offset / 4] = data;
        let block = offset & !0xff;
        if offset - block == registers::LAST_PTR {
            self.starts.lock().push((block, data));
            if !self.stalled {
                self.run(block, data as usize);
            }
        }
    }

    fn write_u64(&self, offset: usize, data: u64) {
        self.write_u32(offset, data as u32);
        self.write_u32(offset + 4, (data >> 32) as u32);
    }
}

struct Fixture {
    service: Arc<EmulatedService>,
    context: DmaContext,
    device: EmulatedDevice,
    endpoint: Arc<EndpointMemory>,
    controller: Arc<EmulatedController>,
}

fn fixture(endpoint_len: usize) -> Fixture {
    let service = Arc::new(EmulatedService::new(EmulatedConfig::default()).unwrap());
    let endpoint = Arc::new(EndpointMemory::new(endpoint_len));
    Fixture {
        context: DmaContext::new(service.clone()),
        device: EmulatedDevice::new(CardHandle(7)),
        controller: Arc::new(EmulatedController::new(service.clone(), endpoint.clone())),
        service,
        endpoint,
    }
}

fn fill_pattern(memory: &MemoryBlock, seed: u32) {
    for index in 0..memory.len() / 4 {
        memory.write_obj(index * 4, &(seed ^ index as u32));
    }
}

#[test]
fn to_device_transfer_in_chunks() {
    let len = 300 * PAGE_SIZE;
    let mut f = fixture(FPGA_OFFSET as usize + len);
    let memory = MemoryBlock::new(UserPages::new(USER_VA, len));
    fill_pattern(&memory, 0xa5a5_0000);

    let mut dma = AvalonMmDma::new(
        &f.context,
        &mut f.device,
        f.controller.clone(),
        &memory,
        len,
        TransferDirection::ToDevice,
        FPGA_OFFSET,
    )
    .unwrap();
    assert_eq!(dma.transaction().max_transfer_size(), MAX_TRANSFER_SIZE);
    assert_eq!(dma.transaction().element_size(), size_of::<Descriptor>());

    dma.run_transaction().unwrap();
    assert_eq!(
        *f.controller.starts.lock(),
        [
            (registers::TO_DEVICE_CONTROL, 126),
            (registers::TO_DEVICE_CONTROL, 126),
            (registers::TO_DEVICE_CONTROL, 45),
        ]
    );
    assert_eq!(dma.transaction().state(), TransactionState::Complete);
    assert_eq!(dma.transaction().bytes_transferred(), len);

    // The table holds the last chunk.
    let first = dma
        .descriptor_table()
        .memory()
        .read_obj::<Descriptor>(descriptor_offset(0));
    assert_eq!(first.dst(), FPGA_OFFSET + 254 * PAGE_SIZE as u64);
    assert_eq!(first.byte_count(), PAGE_SIZE);

    dma.verify(&*f.endpoint).unwrap();

    dma.free().unwrap();
    assert_eq!(f.service.outstanding_pins(), 0);
    assert_eq!(f.context.outstanding_records(), 0);
}

#[test]
fn from_device_transfer_lands_in_host_memory() {
    let len = 130 * PAGE_SIZE;
    let mut f = fixture(FPGA_OFFSET as usize + len);
    for index in 0..len / 4 {
        f.endpoint
            .write_u32(FPGA_OFFSET as usize + index * 4, 0x5a00_0000 ^ index as u32);
    }
    let memory = MemoryBlock::new(UserPages::new(USER_VA, len));

    let mut dma = AvalonMmDma::new(
        &f.context,
        &mut f.device,
        f.controller.clone(),
        &memory,
        len,
        TransferDirection::FromDevice,
        FPGA_OFFSET,
    )
    .unwrap();
    dma.run_transaction().unwrap();

    assert_eq!(
        *f.controller.starts.lock(),
        [
            (registers::FROM_DEVICE_CONTROL, 126),
            (registers::FROM_DEVICE_CONTROL, 2),
        ]
    );
    assert_eq!(memory.read_obj::<u32>(0), 0x5a00_0000);
    assert_eq!(memory.read_obj::<u32>(len - 4), 0x5a00_0000 ^ (len / 4 - 1) as u32);
    dma.verify(&*f.endpoint).unwrap();
    dma.free().unwrap();
    assert_eq!(f.service.outstanding_pins(), 0);
}

#[test]
fn verify_reports_first_mismatch() {
    let len = 4 * PAGE_SIZE;
    let mut f = fixture(FPGA_OFFSET as usize + len);
    let memory = MemoryBlock::new(UserPages::new(USER_VA, len));
    fill_pattern(&memory, 0x1234_0000);

    let mut dma = AvalonMmDma::new(
        &f.context,
        &mut f.device,
        f.controller.clone(),
        &memory,
        len,
        TransferDirection::ToDevice,
        FPGA_OFFSET,
    )
    .unwrap();
    dma.run_transaction().unwrap();
    f.endpoint.write_u32(FPGA_OFFSET as usize + 0x108, 0);

    let err = dma.verify(&*f.endpoint).unwrap_err();
    assert!(matches!(
        err,
        AvalonError::Mismatch {
            offset: 0x108,
            host: 0x1234_0042,
            endpoint: 0,
        }
    ));
    dma.free().unwrap();
}

#[test]
fn transfer_can_run_again_after_release() {
    let len = 2 * PAGE_SIZE;
    let mut f = fixture(FPGA_OFFSET as usize + len);
    let memory = MemoryBlock::new(UserPages::new(USER_VA, len));
    fill_pattern(&memory, 1);

    let mut dma = AvalonMmDma::new(
        &f.context,
        &mut f.device,
        f.controller.clone(),
        &memory,
        len,
        TransferDirection::ToDevice,
        FPGA_OFFSET,
    )
    .unwrap();
    dma.run_transaction().unwrap();
    dma.release().unwrap();

    fill_pattern(&memory, 2);
    dma.run_transaction().unwrap();
    dma.verify(&*f.endpoint).unwrap();
    assert_eq!(f.controller.starts.lock().len(), 2);
    dma.free().unwrap();
    assert_eq!(f.service.outstanding_pins(), 0);
}

#[test]
fn unaligned_chunk_overflowing_the_table_is_rejected() {
    let len = MAX_TRANSFER_SIZE;
    let mut f = fixture(FPGA_OFFSET as usize + len);
    let memory = MemoryBlock::new(UserPages::new(USER_VA + 0x400, len));

    let mut dma = AvalonMmDma::new(
        &f.context,
        &mut f.device,
        f.controller.clone(),
        &memory,
        len,
        TransferDirection::ToDevice,
        FPGA_OFFSET,
    )
    .unwrap();
    let err = dma.run_transaction().unwrap_err();
    assert!(matches!(err, AvalonError::TooManySegments(128)));
    assert!(f.controller.starts.lock().is_empty());

    dma.free().unwrap();
    assert_eq!(f.service.outstanding_pins(), 0);
    assert_eq!(f.context.outstanding_records(), 0);
}

#[test]
fn partial_dword_transfers_are_rejected() {
    let mut f = fixture(FPGA_OFFSET as usize + PAGE_SIZE);
    for (offset, len) in [(0, 10), (0, 0), (0, 3), (2, 8)] {
        let memory = MemoryBlock::new(UserPages::new(USER_VA + offset, PAGE_SIZE));
        let err = AvalonMmDma::new(
            &f.context,
            &mut f.device,
            f.controller.clone(),
            &memory,
            len,
            TransferDirection::ToDevice,
            FPGA_OFFSET,
        )
        .err()
        .unwrap();
        match err {
            AvalonError::InvalidTransfer {
                address,
                byte_count,
            } => {
                assert_eq!(address, USER_VA + offset);
                assert_eq!(byte_count, len);
            }
            err => panic!("unexpected error {err:?}"),
        }
    }
    assert!(f.controller.starts.lock().is_empty());
    assert_eq!(f.service.outstanding_pins(), 0);
    assert_eq!(f.context.outstanding_records(), 0);
}

#[test]
fn short_dword_transfer_reaches_the_endpoint() {
    let len = 12;
    let mut f = fixture(FPGA_OFFSET as usize + PAGE_SIZE);
    let memory = MemoryBlock::new(UserPages::new(USER_VA, len));
    fill_pattern(&memory, 0xab00_0000);

    let mut dma = AvalonMmDma::new(
        &f.context,
        &mut f.device,
        f.controller.clone(),
        &memory,
        len,
        TransferDirection::ToDevice,
        FPGA_OFFSET,
    )
    .unwrap();
    dma.run_transaction().unwrap();
    assert_eq!(dma.transaction().bytes_transferred(), len);
    assert_eq!(
        f.endpoint.read_u32(FPGA_OFFSET as usize + 8),
        0xab00_0000 ^ 2
    );
    assert_eq!(f.endpoint.read_u32(FPGA_OFFSET as usize + 12), 0);
    dma.verify(&*f.endpoint).unwrap();
    dma.free().unwrap();
    assert_eq!(f.service.outstanding_pins(), 0);
}

#[test]
fn stalled_controller_times_out() {
    let len = PAGE_SIZE;
    let mut f = fixture(FPGA_OFFSET as usize + len);
    let controller = Arc::new(EmulatedController {
        stalled: true,
        ..EmulatedController::new(f.service.clone(), f.endpoint.clone())
    });
    let memory = MemoryBlock::new(UserPages::new(USER_VA, len));

    let mut dma = AvalonMmDma::new(
        &f.context,
        &mut f.device,
        controller.clone(),
        &memory,
        len,
        TransferDirection::FromDevice,
        FPGA_OFFSET,
    )
    .unwrap()
    .with_timeout(Duration::from_millis(10));

    let err = dma.run_transaction().unwrap_err();
    assert!(matches!(err, AvalonError::Timeout(_)));
    assert_eq!(dma.transaction().state(), TransactionState::Executing);
    assert_eq!(controller.starts.lock().len(), 1);

    dma.free().unwrap();
    assert_eq!(f.service.outstanding_pins(), 0);
}

#[test]
fn failed_init_unlocks_the_descriptor_table() {
    let mut f = fixture(PAGE_SIZE);
    let memory = MemoryBlock::new(UserPages::new(USER_VA, PAGE_SIZE));
    let err = AvalonMmDma::new(
        &f.context,
        &mut f.device,
        f.controller.clone(),
        &memory,
        2 * PAGE_SIZE,
        TransferDirection::ToDevice,
        0,
    )
    .err()
    .unwrap();
    assert!(matches!(err, AvalonError::Dma(_)));
    assert_eq!(f.service.outstanding_pins(), 0);
    assert_eq!(f.context.outstanding_records(), 0);
}
