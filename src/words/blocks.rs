//! Block words.
//!
//! `BLOCK` maps a Forth block into the arena's window region and returns
//! its vaddr; `UPDATE` copies the window back and marks the block dirty;
//! `FLUSH` persists through the engine. The allocation words drive the
//! BAM, and the metadata accessors move the on-disk record formats
//! through arena buffers so Forth code can inspect and edit them.

use crate::blocks::{BlockMeta, DEVBLOCK_SIZE, FORTH_BLOCK_SIZE, META_PER_BLOCK, VolumeHeader};
use crate::vm::{Cell, VM_MEMORY_SIZE, Vm};

// LIST renders 16x64.
const _: () = assert!(FORTH_BLOCK_SIZE == 16 * 64);

pub(crate) fn register(vm: &mut Vm) {
    vm.define_primitive("BLOCK", block);
    vm.define_primitive("BUFFER", buffer);
    vm.define_primitive("UPDATE", update);
    vm.define_primitive("FLUSH", flush);
    vm.define_primitive("EMPTY-BUFFERS", empty_buffers);
    vm.define_primitive("LIST", list);
    vm.define_primitive("BLOCK-ALLOCATE", block_allocate);
    vm.define_primitive("BLOCK-ALLOCATED?", block_allocated_query);
    vm.define_primitive("BLOCK-CLAIM", block_claim);
    vm.define_primitive("BLOCK-RELEASE", block_release);
    vm.define_primitive("BLOCK-META@", block_meta_fetch);
    vm.define_primitive("BLOCK-META!", block_meta_store);
    vm.define_primitive("VOLUME-INFO", volume_info);
    vm.define_primitive("VOLUME-META@", volume_meta_fetch);
    vm.define_primitive("VOLUME-META!", volume_meta_store);
}

fn pop_lbn(vm: &mut Vm, word: &str) -> Option<u32> {
    let n = vm.pop();
    if vm.error {
        return None;
    }
    if n < 0 || n > Cell::from(u32::MAX) {
        vm.fail(&format!("{word}: invalid block number {n}"));
        return None;
    }
    Some(n as u32)
}

/// Validate an arena span of `len` bytes starting at a popped address.
fn pop_span(vm: &mut Vm, word: &str, len: usize) -> Option<usize> {
    let addr = vm.pop_vaddr()?;
    let at = addr as usize;
    if at + len > VM_MEMORY_SIZE {
        vm.fail(&format!("{word}: {len}-byte record at {addr} leaves VM memory"));
        return None;
    }
    Some(at)
}

fn block(vm: &mut Vm) {
    let Some(lbn) = pop_lbn(vm, "BLOCK") else { return };
    if let Some(addr) = vm.block_vaddr(lbn, false) {
        vm.push(Cell::from(addr));
    }
}

/// Like BLOCK but without reading the old contents.
fn buffer(vm: &mut Vm) {
    let Some(lbn) = pop_lbn(vm, "BUFFER") else { return };
    if let Some(addr) = vm.block_vaddr(lbn, true) {
        vm.push(Cell::from(addr));
    }
}

fn update(vm: &mut Vm) {
    vm.block_update();
}

fn flush(vm: &mut Vm) {
    vm.block_flush(0);
}

fn empty_buffers(vm: &mut Vm) {
    vm.empty_buffers();
}

/// List a block as sixteen 64-character lines and make it SCR.
fn list(vm: &mut Vm) {
    let Some(lbn) = pop_lbn(vm, "LIST") else { return };
    let Some(addr) = vm.block_vaddr(lbn, false) else {
        return;
    };
    let mut out = format!("Block {lbn}\n");
    for line in 0..16u32 {
        let mut text = String::with_capacity(64);
        for col in 0..64u32 {
            let b = vm.load_u8(addr + line * 64 + col);
            if vm.error {
                return;
            }
            text.push(if (0x20..0x7F).contains(&b) { b as char } else { ' ' });
        }
        out.push_str(text.trim_end());
        out.push('\n');
    }
    vm.print(&out);
}

/// `( -- lbn )` claim the first free disk block in the BAM.
fn block_allocate(vm: &mut Vm) {
    match vm.blocks.allocate() {
        Ok(lbn) => vm.push(Cell::from(lbn)),
        Err(err) => vm.fail(&format!("BLOCK-ALLOCATE: {err}")),
    }
}

/// `( lbn -- flag )` whether the BAM bit for a disk block is set.
fn block_allocated_query(vm: &mut Vm) {
    let Some(lbn) = pop_lbn(vm, "BLOCK-ALLOCATED?") else {
        return;
    };
    match vm.blocks.is_allocated(lbn) {
        Ok(allocated) => vm.push(if allocated { -1 } else { 0 }),
        Err(err) => vm.fail(&format!("BLOCK-ALLOCATED?: {err}")),
    }
}

/// `( lbn -- )` mark a disk block allocated without writing to it.
fn block_claim(vm: &mut Vm) {
    let Some(lbn) = pop_lbn(vm, "BLOCK-CLAIM") else { return };
    if let Err(err) = vm.blocks.mark_allocated(lbn) {
        vm.fail(&format!("BLOCK-CLAIM: {err}"));
    }
}

/// `( lbn -- )` return a disk block to the free pool.
fn block_release(vm: &mut Vm) {
    let Some(lbn) = pop_lbn(vm, "BLOCK-RELEASE") else { return };
    if let Err(err) = vm.blocks.mark_free(lbn) {
        vm.fail(&format!("BLOCK-RELEASE: {err}"));
    }
}

/// `( lbn addr -- )` copy a block's metadata record, in its packed
/// on-disk form, into the arena at `addr`.
fn block_meta_fetch(vm: &mut Vm) {
    let Some(at) = pop_span(vm, "BLOCK-META@", META_PER_BLOCK) else {
        return;
    };
    let Some(lbn) = pop_lbn(vm, "BLOCK-META@") else { return };
    let meta = match vm.blocks.block_meta(lbn) {
        Ok(meta) => meta,
        Err(err) => {
            vm.fail(&format!("BLOCK-META@: {err}"));
            return;
        }
    };
    meta.encode(&mut vm.memory[at..at + META_PER_BLOCK]);
}

/// `( addr lbn -- )` replace a block's metadata record from the packed
/// form stored in the arena at `addr`.
fn block_meta_store(vm: &mut Vm) {
    let Some(lbn) = pop_lbn(vm, "BLOCK-META!") else { return };
    let Some(at) = pop_span(vm, "BLOCK-META!", META_PER_BLOCK) else {
        return;
    };
    let meta = BlockMeta::decode(&vm.memory[at..at + META_PER_BLOCK]);
    if let Err(err) = vm.blocks.set_block_meta(lbn, meta) {
        vm.fail(&format!("BLOCK-META!: {err}"));
    }
}

/// `( -- )` print the mounted volume's header summary.
fn volume_info(vm: &mut Vm) {
    let vol = vm.blocks.volume_meta();
    let text = format!(
        "Volume '{}' v{}: devblocks={} bam_devblocks={} tracked={} total={} free={} first-free={}\n",
        vol.label_str(),
        vol.version,
        vol.total_devblocks,
        vol.bam_devblocks,
        vol.tracked_blocks,
        vol.total_blocks,
        vol.free_blocks,
        vol.first_free,
    );
    vm.print(&text);
}

/// `( addr -- )` copy the volume header, in its on-disk form, into the
/// arena at `addr`.
fn volume_meta_fetch(vm: &mut Vm) {
    let Some(at) = pop_span(vm, "VOLUME-META@", DEVBLOCK_SIZE) else {
        return;
    };
    let mut buf = [0u8; DEVBLOCK_SIZE];
    vm.blocks.volume_meta().encode(&mut buf);
    vm.memory[at..at + DEVBLOCK_SIZE].copy_from_slice(&buf);
}

/// `( addr -- )` replace the volume header from the on-disk form stored
/// in the arena at `addr`.
fn volume_meta_store(vm: &mut Vm) {
    let Some(at) = pop_span(vm, "VOLUME-META!", DEVBLOCK_SIZE) else {
        return;
    };
    let buf: &[u8; DEVBLOCK_SIZE] = vm.memory[at..at + DEVBLOCK_SIZE]
        .try_into()
        .expect("span checked");
    let vol = VolumeHeader::decode(buf);
    vm.blocks.set_volume_meta(vol);
}
