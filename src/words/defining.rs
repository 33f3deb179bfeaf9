//! Defining words, execution tokens and system variables.

use crate::dict::WordFunc;
use crate::vm::{Cell, VAddr, Vm};

pub(crate) fn register(vm: &mut Vm) {
    vm.define_primitive("LIT", lit_rt);
    vm.define_primitive("EXIT", exit_rt);
    vm.define_primitive(":", colon);
    vm.define_immediate(";", semicolon);
    vm.define_primitive("IMMEDIATE", immediate);
    vm.define_primitive("CREATE", create);
    vm.define_primitive("VARIABLE", variable);
    vm.define_primitive("CONSTANT", constant);
    vm.define_primitive("FORGET", forget);
    vm.define_primitive("'", tick);
    vm.define_primitive("EXECUTE", execute);
    vm.define_primitive("ABORT", abort);
    vm.define_primitive("STATE", state);
    vm.define_primitive("BASE", base);
    vm.define_primitive("SCR", scr);
    vm.define_primitive("DECIMAL", decimal);
    vm.define_primitive("HEX", hex);
    vm.define_primitive("WORDS", words);
    vm.define_primitive("VERSION", version);
    vm.define_primitive("SEED", seed);
    vm.define_primitive("RANDOM", random);
    vm.define_primitive("BYE", bye);
}

/// Runtime of compiled literals: push the cell at the resume address and
/// step over it.
fn lit_rt(vm: &mut Vm) {
    let Some(at) = vm.rtop_mut().map(|t| *t) else {
        return;
    };
    let v = vm.load_cell(at as VAddr);
    if vm.error {
        return;
    }
    vm.push(v);
    if let Some(t) = vm.rtop_mut() {
        *t = at + crate::vm::CELL as Cell;
    }
}

/// One-shot early return from the current colon body.
fn exit_rt(vm: &mut Vm) {
    vm.exit_colon = true;
}

fn colon(vm: &mut Vm) {
    let Some(name) = vm.parse_word() else {
        vm.fail(": missing name");
        return;
    };
    vm.enter_compile_mode(&name);
}

fn semicolon(vm: &mut Vm) {
    vm.exit_compile_mode();
}

fn immediate(vm: &mut Vm) {
    vm.make_immediate();
}

/// Executing a created word pushes its data-field address.
fn do_var(vm: &mut Vm) {
    let Some(id) = vm.current_word else {
        vm.fail("created word executed without context");
        return;
    };
    let dfa = vm.dict.entry(id).dfa;
    vm.push(Cell::from(dfa));
}

/// Executing a constant pushes the cell stored at its data field.
fn do_const(vm: &mut Vm) {
    let Some(id) = vm.current_word else {
        vm.fail("constant executed without context");
        return;
    };
    let dfa = vm.dict.entry(id).dfa;
    let v = vm.load_cell(dfa);
    if !vm.error {
        vm.push(v);
    }
}

fn define_data_word(vm: &mut Vm, word: &str, func: fn(&mut Vm)) -> bool {
    let Some(name) = vm.parse_word() else {
        vm.fail(&format!("{word}: missing name"));
        return false;
    };
    vm.align();
    let here = vm.here() as VAddr;
    let guard = vm.dict_lock.lock().unwrap_or_else(|e| e.into_inner());
    let created = vm.dict.create(&name, WordFunc::Primitive(func), here, here);
    drop(guard);
    if let Err(err) = created {
        vm.fail(&format!("{word}: {err}"));
        return false;
    }
    true
}

fn create(vm: &mut Vm) {
    define_data_word(vm, "CREATE", do_var);
}

fn variable(vm: &mut Vm) {
    if define_data_word(vm, "VARIABLE", do_var) {
        vm.comma(0);
    }
}

fn constant(vm: &mut Vm) {
    let v = vm.pop();
    if vm.error {
        return;
    }
    if define_data_word(vm, "CONSTANT", do_const) {
        vm.comma(v);
    }
}

fn forget(vm: &mut Vm) {
    let Some(name) = vm.parse_word() else {
        vm.fail("FORGET: missing name");
        return;
    };
    vm.forget(&name);
}

fn tick(vm: &mut Vm) {
    let Some(name) = vm.parse_word() else {
        vm.fail("': missing name");
        return;
    };
    match vm.find_word(&name) {
        Some(id) => vm.push(Cell::from(id)),
        None => vm.fail(&format!("': unknown word '{}'", String::from_utf8_lossy(&name))),
    }
}

fn execute(vm: &mut Vm) {
    let id = vm.pop();
    if vm.error {
        return;
    }
    if id < 0 || id as usize >= vm.dict.len() {
        vm.fail(&format!("EXECUTE: invalid execution token {id}"));
        return;
    }
    vm.execute_id(id as u32);
}

fn abort(vm: &mut Vm) {
    vm.abort();
}

fn state(vm: &mut Vm) {
    let addr = vm.state_addr;
    vm.push(Cell::from(addr));
}

fn base(vm: &mut Vm) {
    let addr = vm.base_addr;
    vm.push(Cell::from(addr));
}

fn scr(vm: &mut Vm) {
    let addr = vm.scr_addr;
    vm.push(Cell::from(addr));
}

fn decimal(vm: &mut Vm) {
    vm.set_base(10);
}

fn hex(vm: &mut Vm) {
    vm.set_base(16);
}

fn words(vm: &mut Vm) {
    let mut line = String::new();
    for &id in vm.dict.order() {
        line.push_str(vm.dict.entry(id).name_str());
        line.push(' ');
    }
    line.push('\n');
    vm.print(&line);
}

fn version(vm: &mut Vm) {
    vm.print(concat!("StarForth ", env!("CARGO_PKG_VERSION"), "\n"));
}

fn seed(vm: &mut Vm) {
    let v = vm.pop();
    if !vm.error {
        vm.prng_state = v as u64;
    }
}

fn random(vm: &mut Vm) {
    let v = vm.prng_next();
    vm.push(v);
}

fn bye(vm: &mut Vm) {
    vm.halted = true;
}
