//! End-to-end script execution tests: delegation, imports, the script
//! slot lifecycle, waits, and storage sharing across the hierarchy

use acsvm_bytecode::{ModuleData, Opcode, ScriptDef, ScriptNameDef, ScriptType, Word};
use acsvm_engine::{ActionKind, Environment, ScopeId, ScriptAction, ScriptName, VmError};
use std::sync::Arc;

fn script(name: Word, stype: ScriptType, entry: u32) -> ScriptDef {
    ScriptDef {
        name: ScriptNameDef::Int(name),
        stype: stype.to_word(),
        entry,
        arg_count: 0,
        local_regs: 4,
        local_arrs: 0,
        flags: 0,
    }
}

fn op(opcode: Opcode) -> Word {
    opcode.to_word()
}

/// Register the module in the addressed map and activate the whole
/// scope chain.
fn activate(env: &mut Environment, id: ScopeId, module: &Arc<acsvm_engine::Module>) {
    let global = env.get_global_scope(id.global);
    global.active = true;
    let hub = global.get_hub_scope(id.hub);
    hub.active = true;
    let map = hub.get_map_scope(id.map);
    map.active = true;
    map.add_module(module);
    map.add_module_finish();
}

/// Open script 1 increments module register 0 once per tick; closed
/// script 2 reads it back.
fn counter_module(name: &str) -> ModuleData {
    let mut data = ModuleData::new(name);
    data.code = vec![
        op(Opcode::PushModReg),
        0,
        op(Opcode::Push),
        1,
        op(Opcode::Add),
        op(Opcode::DropModReg),
        0,
        op(Opcode::Yield),
        op(Opcode::Jump),
        0,
        // getter
        op(Opcode::PushModReg),
        0,
        op(Opcode::SetResult),
        op(Opcode::Terminate),
    ];
    data.scripts.push(script(1, ScriptType::Open, 0));
    data.scripts.push(script(2, ScriptType::Closed, 10));
    data
}

#[test]
fn test_open_script_end_to_end() {
    let mut env = Environment::new();
    let module = env.load_module(&counter_module("level")).unwrap();
    let id = ScopeId::new(0, 0, 0);
    activate(&mut env, id, &module);

    assert_eq!(env.script_start_type(id, ScriptType::Open, &[]), 1);
    assert!(env.has_active_thread());

    for _ in 0..3 {
        env.exec();
    }
    assert_eq!(env.script_start_result(id, ScriptName::Int(2), &[]), 3);
    assert!(env.take_faults().is_empty());
}

#[test]
fn test_action_delegation_waits_for_active_map() {
    let mut env = Environment::new();
    let module = env.load_module(&counter_module("level")).unwrap();
    let id = ScopeId::new(0, 0, 0);
    activate(&mut env, id, &module);
    // Deactivate the map again: the action must park above it.
    env.get_global_scope(0).get_hub_scope(0).get_map_scope(0).active = false;

    env.defer_action(ScriptAction {
        kind: ActionKind::Start,
        id,
        name: ScriptName::Int(1),
        args: Vec::new(),
    });

    env.exec();
    assert!(!env.is_script_active(id, ScriptName::Int(1)));

    env.get_global_scope(0).get_hub_scope(0).get_map_scope(0).active = true;
    env.exec();
    assert!(env.is_script_active(id, ScriptName::Int(1)));
    assert_eq!(env.script_start_result(id, ScriptName::Int(2), &[]), 1);
}

#[test]
fn test_action_to_missing_global_stays_queued() {
    let mut env = Environment::new();
    env.defer_action(ScriptAction {
        kind: ActionKind::Start,
        id: ScopeId::new(9, 9, 9),
        name: ScriptName::Int(1),
        args: Vec::new(),
    });
    // No scope exists; ticking must not lose or misdeliver the action.
    env.exec();
    env.exec();
    assert!(!env.has_active_thread());

    let module = env.load_module(&counter_module("late")).unwrap();
    let id = ScopeId::new(9, 9, 9);
    activate(&mut env, id, &module);
    env.exec();
    assert!(env.is_script_active(id, ScriptName::Int(1)));
}

fn export_import_pair() -> (ModuleData, ModuleData) {
    // corelib exports register 2 under the name "shared", preset to 77;
    // script 3 reads it through corelib's own storage.
    let mut corelib = ModuleData::new("corelib");
    corelib.strings = vec!["shared".to_string()];
    corelib.reg_names = vec![None, None, Some(0)];
    corelib.reg_inits = vec![0, 0, 77];
    corelib.code = vec![
        op(Opcode::PushModReg),
        2,
        op(Opcode::SetResult),
        op(Opcode::Terminate),
    ];
    corelib.scripts.push(script(3, ScriptType::Closed, 0));

    // maplib aliases its register 0 to that export; script 1 reads the
    // alias, script 2 writes through it.
    let mut maplib = ModuleData::new("maplib");
    maplib.strings = vec!["shared".to_string()];
    maplib.reg_imports = vec![Some(0)];
    maplib.imports = vec!["corelib".to_string()];
    maplib.code = vec![
        op(Opcode::PushModReg),
        0,
        op(Opcode::SetResult),
        op(Opcode::Terminate),
        op(Opcode::Push),
        88,
        op(Opcode::DropModReg),
        0,
        op(Opcode::Terminate),
    ];
    maplib.scripts.push(script(1, ScriptType::Closed, 0));
    maplib.scripts.push(script(2, ScriptType::Closed, 4));
    (corelib, maplib)
}

#[test]
fn test_import_resolution_same_under_both_add_orders() {
    let (corelib_data, maplib_data) = export_import_pair();

    for maplib_first in [true, false] {
        let mut env = Environment::new();
        let corelib = env.load_module(&corelib_data).unwrap();
        let maplib = env.load_module(&maplib_data).unwrap();
        let id = ScopeId::new(0, 0, 0);

        let global = env.get_global_scope(0);
        global.active = true;
        let hub = global.get_hub_scope(0);
        hub.active = true;
        let map = hub.get_map_scope(0);
        map.active = true;
        if maplib_first {
            // corelib arrives implicitly through maplib's import list.
            map.add_module(&maplib);
        } else {
            map.add_module(&corelib);
            map.add_module(&maplib);
        }
        map.add_module_finish();

        // The alias reads the exporter's initializer.
        assert_eq!(env.script_start_result(id, ScriptName::Int(1), &[]), 77);
        // Writing through the alias lands in the exporter's storage.
        env.script_start_result(id, ScriptName::Int(2), &[]);
        assert_eq!(env.script_start_result(id, ScriptName::Int(3), &[]), 88);
        assert_eq!(env.script_start_result(id, ScriptName::Int(1), &[]), 88);
    }
}

#[test]
fn test_script_slot_lifecycle() {
    let mut env = Environment::new();
    let mut data = ModuleData::new("slots");
    data.code = vec![op(Opcode::DelayImm), 10, op(Opcode::Terminate)];
    data.scripts.push(script(1, ScriptType::Closed, 0));
    let module = env.load_module(&data).unwrap();
    let id = ScopeId::new(0, 0, 0);
    activate(&mut env, id, &module);
    let name = ScriptName::Int(1);

    assert!(env.script_start(id, name, &[]));
    assert!(env.is_script_active(id, name));

    // Starting again resumes the resident thread instead of stacking a
    // second one.
    assert!(env.script_start(id, name, &[]));
    assert!(env.is_script_active(id, name));

    assert!(env.script_pause(id, name));
    assert!(env.is_script_active(id, name));
    assert!(env.script_start(id, name, &[]));

    // Stop clears the binding synchronously; the thread is reaped on
    // the next tick.
    assert!(env.script_stop(id, name));
    assert!(!env.is_script_active(id, name));
    env.exec();
    assert!(!env.has_active_thread());

    assert!(env.script_start(id, name, &[]));
    assert!(env.is_script_active(id, name));

    // A forced start never touches the binding.
    assert!(env.script_start_forced(id, name, &[]));
    assert!(env.script_stop(id, name));
    assert!(!env.is_script_active(id, name));
    env.exec();
    assert!(env.has_active_thread());

    assert!(!env.script_stop(id, ScriptName::Int(404)));
}

#[test]
fn test_fault_is_isolated_to_its_thread() {
    let mut env = Environment::new();
    let mut data = counter_module("faulty");
    let entry = data.code.len() as u32;
    data.code.extend([
        op(Opcode::Push),
        1,
        op(Opcode::Push),
        0,
        op(Opcode::Div),
        op(Opcode::Terminate),
    ]);
    data.scripts.push(script(9, ScriptType::Closed, entry));
    let module = env.load_module(&data).unwrap();
    let id = ScopeId::new(0, 0, 0);
    activate(&mut env, id, &module);

    env.script_start(id, ScriptName::Int(1), &[]);
    env.script_start(id, ScriptName::Int(9), &[]);
    env.exec();

    let faults = env.take_faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].module, "faulty");
    assert_eq!(faults[0].error, VmError::DivideByZero);

    // The counter kept running.
    assert!(env.is_script_active(id, ScriptName::Int(1)));
    assert!(!env.is_script_active(id, ScriptName::Int(9)));
    assert_eq!(env.script_start_result(id, ScriptName::Int(2), &[]), 1);
}

#[test]
fn test_each_fault_class_stops_only_its_thread() {
    let mut env = Environment::new();
    let mut data = counter_module("brittle");
    let base = data.code.len() as u32; // 14
    data.code.extend([
        // 14: pop from an empty stack
        op(Opcode::Add),
        op(Opcode::Terminate),
        // 16: jump past the code end
        op(Opcode::Jump),
        9999,
        // 18: function 0 calls itself until the call stack fills
        op(Opcode::Call),
        0,
        op(Opcode::Terminate),
        // 21: not an opcode
        0xFFFF_FFFF,
        // 22: duplicate the top of stack until it overflows
        op(Opcode::Push),
        1,
        op(Opcode::Dup),
        op(Opcode::Jump),
        24,
        // 27: trailing Push with its operand past the code end
        op(Opcode::Push),
    ]);
    data.functions.push(acsvm_bytecode::FunctionDef {
        entry: base + 4,
        arg_count: 0,
        local_regs: 0,
        local_arrs: 0,
    });
    for (name, entry) in [(10, 0), (11, 2), (12, 4), (13, 7), (14, 8), (15, 13)] {
        data.scripts.push(script(name, ScriptType::Closed, base + entry));
    }
    let module = env.load_module(&data).unwrap();
    let id = ScopeId::new(0, 0, 0);
    activate(&mut env, id, &module);

    env.script_start(id, ScriptName::Int(1), &[]);
    for name in 10..=15 {
        env.script_start(id, ScriptName::Int(name), &[]);
    }
    env.exec();

    let faults = env.take_faults();
    let errors: Vec<VmError> = faults.iter().map(|fault| fault.error.clone()).collect();
    assert_eq!(
        errors,
        vec![
            VmError::StackUnderflow,
            VmError::JumpOutOfRange(9999),
            VmError::CallStackOverflow,
            VmError::InvalidOpcode(0xFFFF_FFFF),
            VmError::StackOverflow,
            VmError::CodeOutOfRange(28),
        ]
    );
    assert!(faults.iter().all(|fault| fault.module == "brittle"));

    // Every faulted thread is gone; the counter kept running.
    for name in 10..=15 {
        assert!(!env.is_script_active(id, ScriptName::Int(name)));
    }
    assert!(env.is_script_active(id, ScriptName::Int(1)));
    assert_eq!(env.script_start_result(id, ScriptName::Int(2), &[]), 1);
}

#[test]
fn test_unresolvable_string_word_reads_as_empty() {
    let mut env = Environment::new();
    let mut data = ModuleData::new("texts");
    data.strings = vec!["hello".to_string()];
    data.scripts.push(script(1, ScriptType::Closed, 0));
    data.code = vec![op(Opcode::Terminate)];
    let module = env.load_module(&data).unwrap();
    let id = ScopeId::new(0, 0, 0);
    activate(&mut env, id, &module);

    let map = env
        .global_scope(0)
        .and_then(|global| global.hub_scope(0))
        .and_then(|hub| hub.map_scope(0))
        .unwrap();
    assert_eq!(map.get_string(0, env.strings()), Some("hello"));
    // A Word past the module's string list falls back to slot 0.
    assert_eq!(map.get_string(5, env.strings()), Some(""));
}

#[test]
fn test_wait_for_script_completion() {
    let mut env = Environment::new();
    let mut data = ModuleData::new("waits");
    data.code = vec![
        // script 1: sleep two ticks, then terminate
        op(Opcode::DelayImm),
        2,
        op(Opcode::Terminate),
        // script 2: wait for script 1, then record completion
        op(Opcode::Push),
        1,
        op(Opcode::WaitScrI),
        op(Opcode::Push),
        9,
        op(Opcode::DropModReg),
        0,
        op(Opcode::Terminate),
        // script 3: read the record
        op(Opcode::PushModReg),
        0,
        op(Opcode::SetResult),
        op(Opcode::Terminate),
    ];
    data.scripts.push(script(1, ScriptType::Closed, 0));
    data.scripts.push(script(2, ScriptType::Closed, 3));
    data.scripts.push(script(3, ScriptType::Closed, 11));
    let module = env.load_module(&data).unwrap();
    let id = ScopeId::new(0, 0, 0);
    activate(&mut env, id, &module);

    env.script_start(id, ScriptName::Int(1), &[]);
    env.script_start(id, ScriptName::Int(2), &[]);

    for _ in 0..3 {
        env.exec();
    }
    assert!(env.is_script_active(id, ScriptName::Int(2)));
    assert_eq!(env.script_start_result(id, ScriptName::Int(3), &[]), 0);

    // Script 1 terminates this tick and script 2 unblocks in the same
    // pass.
    env.exec();
    assert!(!env.is_script_active(id, ScriptName::Int(2)));
    assert_eq!(env.script_start_result(id, ScriptName::Int(3), &[]), 9);
}

#[test]
fn test_wait_on_inactive_script_does_not_block() {
    let mut env = Environment::new();
    let mut data = ModuleData::new("nowait");
    data.code = vec![
        op(Opcode::Push),
        42, // no script named 42 is running
        op(Opcode::WaitScrI),
        op(Opcode::Push),
        1,
        op(Opcode::SetResult),
        op(Opcode::Terminate),
    ];
    data.scripts.push(script(1, ScriptType::Closed, 0));
    let module = env.load_module(&data).unwrap();
    let id = ScopeId::new(0, 0, 0);
    activate(&mut env, id, &module);

    assert_eq!(env.script_start_result(id, ScriptName::Int(1), &[]), 1);
}

#[test]
fn test_notify_tag_wakes_waiters() {
    let mut env = Environment::new();
    let mut data = ModuleData::new("tags");
    data.code = vec![
        op(Opcode::Push),
        7,
        op(Opcode::WaitTag),
        op(Opcode::Push),
        1,
        op(Opcode::DropModReg),
        0,
        op(Opcode::Terminate),
        op(Opcode::PushModReg),
        0,
        op(Opcode::SetResult),
        op(Opcode::Terminate),
    ];
    data.scripts.push(script(1, ScriptType::Closed, 0));
    data.scripts.push(script(2, ScriptType::Closed, 8));
    let module = env.load_module(&data).unwrap();
    let id = ScopeId::new(0, 0, 0);
    activate(&mut env, id, &module);

    env.script_start(id, ScriptName::Int(1), &[]);
    env.exec();
    env.exec();
    assert!(env.is_script_active(id, ScriptName::Int(1)));
    assert_eq!(env.script_start_result(id, ScriptName::Int(2), &[]), 0);

    // The wrong tag wakes nothing.
    env.notify_tag(id, 8);
    env.exec();
    assert!(env.is_script_active(id, ScriptName::Int(1)));

    env.notify_tag(id, 7);
    env.exec();
    assert!(!env.is_script_active(id, ScriptName::Int(1)));
    assert_eq!(env.script_start_result(id, ScriptName::Int(2), &[]), 1);
}

#[test]
fn test_print_buffer_interns_result() {
    let mut env = Environment::new();
    let mut data = ModuleData::new("printer");
    data.code = vec![
        op(Opcode::BeginPrint),
        op(Opcode::Push),
        65, // 'A'
        op(Opcode::PrintChar),
        op(Opcode::Push),
        (-3i32) as Word,
        op(Opcode::PrintNumber),
        op(Opcode::EndPrint),
        op(Opcode::SetResult),
        op(Opcode::Terminate),
    ];
    data.scripts.push(script(1, ScriptType::Closed, 0));
    let module = env.load_module(&data).unwrap();
    let id = ScopeId::new(0, 0, 0);
    activate(&mut env, id, &module);

    let result = env.script_start_result(id, ScriptName::Int(1), &[]);
    assert_eq!(env.strings().get_tagged(result), Some("A-3"));
}

#[test]
fn test_hub_and_global_storage_shared_across_maps() {
    let mut env = Environment::new();

    let mut writer = ModuleData::new("writer");
    writer.code = vec![
        op(Opcode::Push),
        11,
        op(Opcode::DropHubReg),
        0,
        op(Opcode::Push),
        22,
        op(Opcode::DropGblReg),
        0,
        op(Opcode::Push),
        5, // element index
        op(Opcode::Push),
        33, // value
        op(Opcode::DropGblArr),
        0,
        op(Opcode::Terminate),
    ];
    writer.scripts.push(script(1, ScriptType::Closed, 0));

    let mut reader = ModuleData::new("reader");
    reader.code = vec![
        op(Opcode::PushHubReg),
        0,
        op(Opcode::SetResult),
        op(Opcode::Terminate),
        op(Opcode::PushGblReg),
        0,
        op(Opcode::SetResult),
        op(Opcode::Terminate),
        op(Opcode::Push),
        5,
        op(Opcode::PushGblArr),
        0,
        op(Opcode::SetResult),
        op(Opcode::Terminate),
    ];
    reader.scripts.push(script(2, ScriptType::Closed, 0));
    reader.scripts.push(script(3, ScriptType::Closed, 4));
    reader.scripts.push(script(4, ScriptType::Closed, 8));

    let writer = env.load_module(&writer).unwrap();
    let reader = env.load_module(&reader).unwrap();

    let map_a = ScopeId::new(0, 0, 0);
    let map_b = ScopeId::new(0, 0, 1); // same hub
    let map_c = ScopeId::new(0, 1, 2); // same global, other hub
    activate(&mut env, map_a, &writer);
    activate(&mut env, map_b, &reader);
    activate(&mut env, map_c, &reader);

    env.script_start_result(map_a, ScriptName::Int(1), &[]);

    // Same hub sees both banks.
    assert_eq!(env.script_start_result(map_b, ScriptName::Int(2), &[]), 11);
    assert_eq!(env.script_start_result(map_b, ScriptName::Int(3), &[]), 22);
    assert_eq!(env.script_start_result(map_b, ScriptName::Int(4), &[]), 33);

    // Another hub shares only the global bank.
    assert_eq!(env.script_start_result(map_c, ScriptName::Int(2), &[]), 0);
    assert_eq!(env.script_start_result(map_c, ScriptName::Int(3), &[]), 22);
    assert_eq!(env.script_start_result(map_c, ScriptName::Int(4), &[]), 33);
}

#[test]
fn test_call_and_return() {
    let mut env = Environment::new();
    let mut data = ModuleData::new("calls");
    data.code = vec![
        // script: push 4 and 9, call function 0, return its value
        op(Opcode::Push),
        4,
        op(Opcode::Push),
        9,
        op(Opcode::Call),
        0,
        op(Opcode::SetResult),
        op(Opcode::Terminate),
        // function 0: add its two arguments
        op(Opcode::PushLocalReg),
        0,
        op(Opcode::PushLocalReg),
        1,
        op(Opcode::Add),
        op(Opcode::Retn),
    ];
    data.scripts.push(script(1, ScriptType::Closed, 0));
    data.functions.push(acsvm_bytecode::FunctionDef {
        entry: 8,
        arg_count: 2,
        local_regs: 2,
        local_arrs: 0,
    });
    let module = env.load_module(&data).unwrap();
    let id = ScopeId::new(0, 0, 0);
    activate(&mut env, id, &module);

    assert_eq!(env.script_start_result(id, ScriptName::Int(1), &[]), 13);
}

#[test]
fn test_script_arguments_land_in_local_registers() {
    let mut env = Environment::new();
    let mut data = ModuleData::new("args");
    data.code = vec![
        op(Opcode::PushLocalReg),
        0,
        op(Opcode::PushLocalReg),
        1,
        op(Opcode::Sub),
        op(Opcode::SetResult),
        op(Opcode::Terminate),
    ];
    data.scripts.push(ScriptDef {
        name: ScriptNameDef::Int(1),
        stype: ScriptType::Closed.to_word(),
        entry: 0,
        arg_count: 2,
        local_regs: 4,
        local_arrs: 0,
        flags: 0,
    });
    let module = env.load_module(&data).unwrap();
    let id = ScopeId::new(0, 0, 0);
    activate(&mut env, id, &module);

    assert_eq!(
        env.script_start_result(id, ScriptName::Int(1), &[50, 8]),
        42
    );
}
