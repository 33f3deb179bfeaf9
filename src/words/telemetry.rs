//! Execution-heat and cache telemetry words.
//!
//! The heat accessors take an execution token and refuse to operate on one
//! that is not reachable by walking the dictionary from its head; the walk
//! holds the dictionary lock.

use crate::dict::WordId;
use crate::fixed;
use crate::vm::{Cell, Vm};

pub(crate) fn register(vm: &mut Vm) {
    vm.define_primitive("ENTROPY@", entropy_fetch);
    vm.define_primitive("ENTROPY!", entropy_store);
    vm.define_primitive("WORD-ENTROPY", word_entropy);
    vm.define_primitive("RESET-ENTROPY", reset_entropy);
    vm.define_primitive("TOP-WORDS", top_words);
    vm.define_primitive("CACHE-STATS", cache_stats);
    vm.define_primitive("PHYSICS-RESET-STATS", physics_reset);
    vm.define_primitive("BUCKET-REORDER", bucket_reorder);
}

fn pop_owned_word(vm: &mut Vm, word: &str) -> Option<WordId> {
    let raw = vm.pop();
    if vm.error {
        return None;
    }
    if raw < 0 || raw as usize >= vm.dict.len() {
        vm.fail(&format!("{word}: invalid dictionary entry {raw}"));
        return None;
    }
    let id = raw as WordId;
    let guard = vm.dict_lock.lock().unwrap_or_else(|e| e.into_inner());
    let owned = vm.dict.owns(id);
    drop(guard);
    if !owned {
        vm.fail(&format!("{word}: entry {id} not in dictionary"));
        return None;
    }
    Some(id)
}

/// `( xt -- heat )` raw Q48.16 execution heat of a word.
fn entropy_fetch(vm: &mut Vm) {
    let Some(id) = pop_owned_word(vm, "ENTROPY@") else {
        return;
    };
    let heat = vm.dict.entry(id).execution_heat;
    vm.push(heat);
    log::debug!("ENTROPY@: heat of '{}' = {heat}", vm.dict.entry(id).name_str());
}

/// `( heat xt -- )` overwrite a word's execution heat.
fn entropy_store(vm: &mut Vm) {
    let Some(id) = pop_owned_word(vm, "ENTROPY!") else {
        return;
    };
    let v = vm.pop();
    if vm.error {
        return;
    }
    vm.dict.entry_mut(id).execution_heat = v;
}

fn word_entropy(vm: &mut Vm) {
    let mut out = String::new();
    for id in 0..vm.dict.len() as WordId {
        let entry = vm.dict.entry(id);
        if entry.execution_heat > 0 {
            out.push_str(&format!(
                "{:<16} {:.1}\n",
                entry.name_str(),
                fixed::to_f64(entry.execution_heat)
            ));
        }
    }
    vm.print(&out);
}

fn reset_entropy(vm: &mut Vm) {
    for id in 0..vm.dict.len() as WordId {
        vm.dict.entry_mut(id).execution_heat = 0;
    }
}

fn top_words(vm: &mut Vm) {
    let mut ranked: Vec<(Cell, WordId)> = (0..vm.dict.len() as WordId)
        .map(|id| (vm.dict.entry(id).execution_heat, id))
        .filter(|&(heat, _)| heat > 0)
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0));

    let mut out = String::from("Hottest words:\n");
    for (rank, (heat, id)) in ranked.iter().take(10).enumerate() {
        out.push_str(&format!(
            "  {:>2}. {:<16} {:.1}\n",
            rank + 1,
            vm.dict.entry(*id).name_str(),
            fixed::to_f64(*heat)
        ));
    }
    vm.print(&out);
}

fn cache_stats(vm: &mut Vm) {
    let report = vm.cache.stats.summary();
    vm.print(&report);
}

fn physics_reset(vm: &mut Vm) {
    vm.cache.reset_stats();
}

fn bucket_reorder(vm: &mut Vm) {
    vm.cache.reorder_bucket(&mut vm.dict);
}
