//! Block subsystem scenarios through the Forth surface and across
//! device reattachment.

use std::rc::Rc;

use starforth::blkio::{BlockDevice, FileDevice, RamDevice};
use starforth::blocks::{DISK_SYS_RESERVED, RAM_BLOCKS, RAM_SYS_RESERVED, VOLUME_MAGIC};
use starforth::host::CapturingHost;
use starforth::vm::{Cell, Vm};

const RAM_USER: u32 = RAM_BLOCKS - RAM_SYS_RESERVED;

fn boot_with(device: Box<dyn BlockDevice>) -> (Vm, Rc<CapturingHost>) {
    let host = Rc::new(CapturingHost::new());
    let mut vm = Vm::new(host.clone());
    vm.blocks
        .attach_device(device, host.as_ref())
        .expect("attach");
    (vm, host)
}

/// Write `0x01..=0x0A` into a block through BLOCK / C! / UPDATE / FLUSH and
/// read it back through BLOCK.
fn block_round_trip(vm: &mut Vm, lbn: u32) {
    vm.interpret(&format!("{lbn} BLOCK"));
    assert!(!vm.error);
    let addr = vm.pop();
    for i in 0..10 {
        vm.interpret(&format!("{} {} C!", i + 1, addr + Cell::from(i)));
        assert!(!vm.error);
    }
    vm.interpret("UPDATE FLUSH");
    assert!(!vm.error);

    vm.empty_buffers();
    vm.interpret(&format!("{lbn} BLOCK"));
    assert!(!vm.error);
    let addr = vm.pop();
    for i in 0..10u32 {
        assert_eq!(
            (i + 1) as u8,
            vm.load_u8(addr as u32 + i),
            "byte {i} of block {lbn}"
        );
    }
}

#[test]
fn ram_block_round_trip_with_ram_disk() {
    // Equivalent of --ram-disk=2.
    let (mut vm, _host) = boot_with(Box::new(RamDevice::with_mebibytes(2)));
    block_round_trip(&mut vm, 0);
}

#[test]
fn disk_block_round_trip() {
    let (mut vm, _host) = boot_with(Box::new(RamDevice::with_mebibytes(2)));
    block_round_trip(&mut vm, RAM_USER);
}

#[test]
fn disk_block_survives_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("starforth.img");
    let lbn = RAM_USER + 3;

    {
        let device = FileDevice::open(&path, 2048, false).unwrap();
        let (mut vm, _host) = boot_with(Box::new(device));
        block_round_trip(&mut vm, lbn);
        vm.blocks.detach().unwrap();
    }

    // A fresh VM over the same image sees the same bytes and BAM state.
    let device = FileDevice::open(&path, 0, false).unwrap();
    let (mut vm, _host) = boot_with(Box::new(device));
    assert!(vm.blocks.is_allocated(lbn).unwrap());

    vm.interpret(&format!("{lbn} BLOCK"));
    assert!(!vm.error);
    let addr = vm.pop();
    for i in 0..10u32 {
        assert_eq!((i + 1) as u8, vm.load_u8(addr as u32 + i));
    }
    assert!(vm.blocks.verify_block(lbn).unwrap());
}

#[test]
fn fresh_format_writes_v2_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blank.img");
    // An all-zero image formats on attach.
    let device = FileDevice::open(&path, 1024, false).unwrap();
    let (mut vm, _host) = boot_with(Box::new(device));

    let vol = vm.blocks.volume_meta().clone();
    assert_eq!(VOLUME_MAGIC, vol.magic);
    assert_eq!(2, vol.version);
    assert!(vol.bam_devblocks > 0);
    assert_eq!(
        vol.total_blocks - u64::from(DISK_SYS_RESERVED),
        vol.free_blocks
    );
    vm.blocks.detach().unwrap();

    // Raw image now starts with the magic, little-endian.
    let image = std::fs::read(&path).unwrap();
    assert_eq!(&VOLUME_MAGIC.to_le_bytes(), &image[0..4]);

    // Reopen: loads without reformatting.
    let device = FileDevice::open(&path, 0, false).unwrap();
    let (vm2, _host) = boot_with(Box::new(device));
    assert_eq!(vol.created_time, vm2.blocks.volume_meta().created_time);
    assert_eq!(vol.free_blocks, vm2.blocks.volume_meta().free_blocks);
}

#[test]
fn update_allocates_in_bam_exactly_once() {
    let (mut vm, _host) = boot_with(Box::new(RamDevice::with_mebibytes(2)));
    let lbn = RAM_USER;
    let free_before = vm.blocks.volume_meta().free_blocks;

    vm.interpret(&format!("{lbn} BLOCK DROP UPDATE UPDATE FLUSH"));
    assert!(!vm.error);
    assert!(vm.blocks.is_allocated(lbn).unwrap());
    assert_eq!(free_before - 1, vm.blocks.volume_meta().free_blocks);
}

#[test]
fn buffer_skips_read_and_list_renders() {
    let (mut vm, host) = boot_with(Box::new(RamDevice::with_mebibytes(2)));
    vm.interpret("5 BUFFER");
    assert!(!vm.error);
    let addr = vm.pop();
    // BUFFER hands back a zeroed block.
    assert_eq!(0, vm.load_u8(addr as u32));

    // Put printable text in line 0 and LIST it.
    for (i, b) in b"HELLO BLOCKS".iter().enumerate() {
        vm.interpret(&format!("{} {} C!", b, addr + i as Cell));
    }
    vm.interpret("UPDATE 5 LIST");
    assert!(!vm.error);
    let out = host.take_output();
    assert!(out.contains("Block 5"));
    assert!(out.contains("HELLO BLOCKS"));

    // LIST sets SCR.
    vm.interpret("SCR @ .");
    assert!(host.take_output().contains('5'));
}

#[test]
fn allocate_via_engine_matches_forth_view() {
    let (mut vm, _host) = boot_with(Box::new(RamDevice::with_mebibytes(2)));
    let lbn = vm.blocks.allocate().unwrap();
    assert_eq!(RAM_USER, lbn);
    assert!(vm.blocks.is_allocated(lbn).unwrap());

    // The allocated block is usable from Forth.
    vm.interpret(&format!("{lbn} BLOCK DROP UPDATE FLUSH"));
    assert!(!vm.error);
}

#[test]
fn bam_words_allocate_query_and_release() {
    let (mut vm, _host) = boot_with(Box::new(RamDevice::with_mebibytes(2)));

    vm.interpret("BLOCK-ALLOCATE");
    assert!(!vm.error);
    let lbn = vm.pop();
    assert_eq!(Cell::from(RAM_USER), lbn);

    vm.interpret(&format!("{lbn} BLOCK-ALLOCATED?"));
    assert!(!vm.error);
    assert_eq!(-1, vm.pop());

    vm.interpret(&format!("{lbn} BLOCK-RELEASE {lbn} BLOCK-ALLOCATED?"));
    assert!(!vm.error);
    assert_eq!(0, vm.pop());

    let free_before = vm.blocks.volume_meta().free_blocks;
    vm.interpret(&format!("{lbn} BLOCK-CLAIM"));
    assert!(!vm.error);
    assert!(vm.blocks.is_allocated(lbn as u32).unwrap());
    assert_eq!(free_before - 1, vm.blocks.volume_meta().free_blocks);

    // RAM blocks carry no BAM state.
    vm.interpret("0 BLOCK-ALLOCATED?");
    assert!(vm.error);
}

#[test]
fn block_meta_words_round_trip_the_record() {
    let (mut vm, host) = boot_with(Box::new(RamDevice::with_mebibytes(2)));
    let lbn = RAM_USER + 1;
    vm.interpret(&format!("{lbn} BLOCK DROP UPDATE"));
    assert!(!vm.error);

    // Fetch the packed record into an allotted arena buffer.
    let addr = vm.here();
    vm.interpret(&format!("344 ALLOT  {lbn} {addr} BLOCK-META@"));
    assert!(!vm.error);
    let engine_meta = vm.blocks.block_meta(lbn).unwrap();
    // magic sits at offset 8, checksum at 0 — both little-endian.
    let word_at = |vm: &mut Vm, off: u32| {
        let mut bytes = [0u8; 8];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = vm.load_u8(addr as u32 + off + i as u32);
        }
        u64::from_le_bytes(bytes)
    };
    assert_eq!(engine_meta.checksum, word_at(&mut vm, 0));
    assert_eq!(engine_meta.magic, word_at(&mut vm, 8));

    // Patch owner_id (offset 136) in the buffer and store it back.
    for (i, b) in 42u64.to_le_bytes().iter().enumerate() {
        vm.store_u8(addr as u32 + 136 + i as u32, *b);
    }
    vm.interpret(&format!("{addr} {lbn} BLOCK-META!"));
    assert!(!vm.error);
    assert_eq!(42, vm.blocks.block_meta(lbn).unwrap().owner_id);

    // VOLUME-INFO renders the header summary.
    vm.interpret("VOLUME-INFO");
    assert!(!vm.error);
    assert!(host.take_output().contains("StarForth Volume"));
}

#[test]
fn volume_meta_words_round_trip_the_header() {
    let (mut vm, _host) = boot_with(Box::new(RamDevice::with_mebibytes(2)));
    let before = vm.blocks.volume_meta().clone();

    let addr = vm.here();
    vm.interpret(&format!("4096 ALLOT  {addr} VOLUME-META@"));
    assert!(!vm.error);
    assert_eq!(
        &VOLUME_MAGIC.to_le_bytes(),
        &[
            vm.load_u8(addr as u32),
            vm.load_u8(addr as u32 + 1),
            vm.load_u8(addr as u32 + 2),
            vm.load_u8(addr as u32 + 3),
        ]
    );

    vm.interpret(&format!("{addr} VOLUME-META!"));
    assert!(!vm.error);
    assert_eq!(&before, vm.blocks.volume_meta());
}

#[test]
fn out_of_range_block_fails() {
    let (mut vm, _host) = boot_with(Box::new(RamDevice::with_mebibytes(2)));
    let total = vm.blocks.total_blocks();
    vm.interpret(&format!("{total} BLOCK"));
    assert!(vm.error);
    vm.quiesce();

    // Every valid LBN is reachable.
    assert!(vm.blocks.get_buffer(total - 1, false).is_ok());
}
