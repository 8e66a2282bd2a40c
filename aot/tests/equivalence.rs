// equivalence.rs - compiled and interpreted execution agree
//
// Every scenario here runs the same module both fully compiled and with
// functions forced into the interpreter, and expects identical results.
// The tricky cases are deliberate: deferred local reads that a later
// write must not clobber, branches that carry values, exceptions
// crossing the compiled/interpreted boundary, and cancellation.

use std::borrow::Cow;
use wasm_encoder::{
    BlockType, Catch, CodeSection, ExportKind, ExportSection, Function, FunctionSection,
    Instruction, Module, TagKind, TagSection, TagType, TypeSection, ValType,
};
use wasm2rvm::{
    compile, CancelToken, CompilerConfig, ExecError, Imports, TrapKind, Value,
};

struct ModuleBuilder {
    types: TypeSection,
    funcs: FunctionSection,
    tags: TagSection,
    exports: ExportSection,
    code: CodeSection,
    n_funcs: u32,
    n_tags: u32,
}

impl ModuleBuilder {
    fn new() -> ModuleBuilder {
        ModuleBuilder {
            types: TypeSection::new(),
            funcs: FunctionSection::new(),
            tags: TagSection::new(),
            exports: ExportSection::new(),
            code: CodeSection::new(),
            n_funcs: 0,
            n_tags: 0,
        }
    }

    fn ty(&mut self, params: Vec<ValType>, results: Vec<ValType>) -> u32 {
        self.types.ty().function(params, results);
        self.types.len() - 1
    }

    fn tag(&mut self, type_idx: u32) -> u32 {
        self.tags.tag(TagType {
            kind: TagKind::Exception,
            func_type_idx: type_idx,
        });
        self.n_tags += 1;
        self.n_tags - 1
    }

    fn func(
        &mut self,
        type_idx: u32,
        export: Option<&str>,
        locals: Vec<(u32, ValType)>,
        body: &[Instruction],
    ) -> u32 {
        self.funcs.function(type_idx);
        let index = self.n_funcs;
        self.n_funcs += 1;
        if let Some(name) = export {
            self.exports.export(name, ExportKind::Func, index);
        }
        let mut f = Function::new(locals);
        for instr in body {
            f.instruction(instr);
        }
        f.instruction(&Instruction::End);
        self.code.function(&f);
        index
    }

    fn finish(self) -> Vec<u8> {
        let mut m = Module::new();
        m.section(&self.types);
        m.section(&self.funcs);
        if self.n_tags > 0 {
            m.section(&self.tags);
        }
        m.section(&self.exports);
        m.section(&self.code);
        m.finish()
    }
}

fn run_with(
    wasm: &[u8],
    config: &CompilerConfig,
    export: &str,
    args: &[Value],
) -> Result<Vec<Value>, ExecError> {
    let output = compile(wasm, config).expect("compilation failed");
    let mut machine = output.factory.instantiate(&Imports::new()).unwrap();
    machine.call_export(export, args)
}

/// Run `export` under every compiled/interpreted assignment of the
/// module's functions and assert that all agree on `expected`.
fn assert_all_modes(wasm: &[u8], n_funcs: u32, export: &str, args: &[Value], expected: &[Value]) {
    let subsets: Vec<Vec<u32>> = (0..1u32 << n_funcs)
        .map(|mask| (0..n_funcs).filter(|i| mask & (1 << i) != 0).collect())
        .collect();
    for force_interpret in subsets {
        let config = CompilerConfig {
            force_interpret: force_interpret.clone(),
            ..CompilerConfig::default()
        };
        let got = run_with(wasm, &config, export, args).unwrap();
        assert_eq!(
            got, expected,
            "divergence with interpreted functions {force_interpret:?}"
        );
    }
}

#[test]
fn test_deferred_local_read_survives_write() {
    // The first read of x must see the value before local.set clobbers it.
    let mut b = ModuleBuilder::new();
    let ty = b.ty(vec![ValType::I32], vec![ValType::I32]);
    b.func(
        ty,
        Some("f"),
        vec![],
        &[
            Instruction::LocalGet(0),
            Instruction::LocalGet(0),
            Instruction::I32Const(1),
            Instruction::I32Shl,
            Instruction::LocalSet(0),
        ],
    );
    let wasm = b.finish();
    for input in [10, 42, 0] {
        assert_all_modes(&wasm, 1, "f", &[Value::I32(input)], &[Value::I32(input)]);
    }
}

#[test]
fn test_multiple_pending_reads_snapshot_together() {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(vec![ValType::I32], vec![ValType::I32]);
    b.func(
        ty,
        Some("f"),
        vec![],
        &[
            Instruction::LocalGet(0),
            Instruction::LocalGet(0),
            Instruction::LocalGet(0),
            Instruction::I32Const(5),
            Instruction::LocalSet(0),
            Instruction::I32Add,
            Instruction::I32Add,
        ],
    );
    let wasm = b.finish();
    assert_all_modes(&wasm, 1, "f", &[Value::I32(10)], &[Value::I32(30)]);
}

#[test]
fn test_swap_through_locals() {
    // Swaps the params via the stack, then returns new_a * 1000 + new_b.
    let mut b = ModuleBuilder::new();
    let ty = b.ty(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
    b.func(
        ty,
        Some("swap"),
        vec![],
        &[
            Instruction::LocalGet(0),
            Instruction::LocalGet(1),
            Instruction::LocalSet(0),
            Instruction::LocalSet(1),
            Instruction::LocalGet(0),
            Instruction::I32Const(1000),
            Instruction::I32Mul,
            Instruction::LocalGet(1),
            Instruction::I32Add,
        ],
    );
    let wasm = b.finish();
    assert_all_modes(
        &wasm,
        1,
        "swap",
        &[Value::I32(3), Value::I32(7)],
        &[Value::I32(7003)],
    );
    assert_all_modes(
        &wasm,
        1,
        "swap",
        &[Value::I32(100), Value::I32(200)],
        &[Value::I32(200100)],
    );
}

#[test]
fn test_branches_carrying_values() {
    // block (result i32): push 7, conditionally replace with 9 via br.
    let mut b = ModuleBuilder::new();
    let ty = b.ty(vec![ValType::I32], vec![ValType::I32]);
    b.func(
        ty,
        Some("pick"),
        vec![],
        &[
            Instruction::Block(BlockType::Result(ValType::I32)),
            Instruction::I32Const(9),
            Instruction::LocalGet(0),
            Instruction::BrIf(0),
            Instruction::Drop,
            Instruction::I32Const(7),
            Instruction::End,
        ],
    );
    let wasm = b.finish();
    assert_all_modes(&wasm, 1, "pick", &[Value::I32(1)], &[Value::I32(9)]);
    assert_all_modes(&wasm, 1, "pick", &[Value::I32(0)], &[Value::I32(7)]);
}

#[test]
fn test_loop_counts_down() {
    // Classic countdown accumulating a sum: sum(1..=n).
    let mut b = ModuleBuilder::new();
    let ty = b.ty(vec![ValType::I32], vec![ValType::I32]);
    b.func(
        ty,
        Some("sum"),
        vec![(1, ValType::I32)],
        &[
            Instruction::Block(BlockType::Empty),
            Instruction::Loop(BlockType::Empty),
            Instruction::LocalGet(0),
            Instruction::I32Eqz,
            Instruction::BrIf(1),
            Instruction::LocalGet(1),
            Instruction::LocalGet(0),
            Instruction::I32Add,
            Instruction::LocalSet(1),
            Instruction::LocalGet(0),
            Instruction::I32Const(1),
            Instruction::I32Sub,
            Instruction::LocalSet(0),
            Instruction::Br(0),
            Instruction::End,
            Instruction::End,
            Instruction::LocalGet(1),
        ],
    );
    let wasm = b.finish();
    assert_all_modes(&wasm, 1, "sum", &[Value::I32(10)], &[Value::I32(55)]);
    assert_all_modes(&wasm, 1, "sum", &[Value::I32(0)], &[Value::I32(0)]);
}

#[test]
fn test_br_table_selects_arms() {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(vec![ValType::I32], vec![ValType::I32]);
    b.func(
        ty,
        Some("dispatch"),
        vec![],
        &[
            Instruction::Block(BlockType::Empty),
            Instruction::Block(BlockType::Empty),
            Instruction::Block(BlockType::Empty),
            Instruction::LocalGet(0),
            Instruction::BrTable(Cow::from(vec![0, 1]), 2),
            Instruction::End,
            Instruction::I32Const(100),
            Instruction::Return,
            Instruction::End,
            Instruction::I32Const(200),
            Instruction::Return,
            Instruction::End,
            Instruction::I32Const(300),
        ],
    );
    let wasm = b.finish();
    assert_all_modes(&wasm, 1, "dispatch", &[Value::I32(0)], &[Value::I32(100)]);
    assert_all_modes(&wasm, 1, "dispatch", &[Value::I32(1)], &[Value::I32(200)]);
    assert_all_modes(&wasm, 1, "dispatch", &[Value::I32(9)], &[Value::I32(300)]);
}

fn throw_module() -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    let void = b.ty(vec![], vec![]);
    let takes_i32 = b.ty(vec![ValType::I32], vec![]);
    let i32_to_i32 = b.ty(vec![ValType::I32], vec![ValType::I32]);
    let tag = b.tag(void);

    let throw_if = b.func(
        takes_i32,
        None,
        vec![],
        &[
            Instruction::LocalGet(0),
            Instruction::If(BlockType::Empty),
            Instruction::Throw(tag),
            Instruction::End,
        ],
    );

    // A catchless try_table wraps the call; the exception passes straight
    // through it to the outer catch_all. Returns 0 on the normal path, 1
    // when the exception arrives.
    b.func(
        i32_to_i32,
        Some("catchless-try"),
        vec![],
        &[
            Instruction::Block(BlockType::Empty),
            Instruction::TryTable(
                BlockType::Empty,
                Cow::from(vec![Catch::All { label: 0 }]),
            ),
            Instruction::TryTable(BlockType::Empty, Cow::from(vec![])),
            Instruction::LocalGet(0),
            Instruction::Call(throw_if),
            Instruction::End,
            Instruction::End,
            Instruction::I32Const(0),
            Instruction::Return,
            Instruction::End,
            Instruction::I32Const(1),
        ],
    );
    b.finish()
}

#[test]
fn test_exception_crosses_function_boundaries() {
    // Every compiled/interpreted assignment of (throw_if, catchless-try),
    // including the two mixed directions.
    let wasm = throw_module();
    assert_all_modes(&wasm, 2, "catchless-try", &[Value::I32(0)], &[Value::I32(0)]);
    assert_all_modes(&wasm, 2, "catchless-try", &[Value::I32(1)], &[Value::I32(1)]);
}

#[test]
fn test_tagged_catch_receives_payload() {
    let mut b = ModuleBuilder::new();
    let takes_i32 = b.ty(vec![ValType::I32], vec![]);
    let i32_to_i32 = b.ty(vec![ValType::I32], vec![ValType::I32]);
    let tag = b.tag(takes_i32);

    let thrower = b.func(
        takes_i32,
        None,
        vec![],
        &[Instruction::LocalGet(0), Instruction::Throw(tag)],
    );
    b.func(
        i32_to_i32,
        Some("echo"),
        vec![],
        &[
            Instruction::Block(BlockType::Result(ValType::I32)),
            Instruction::TryTable(
                BlockType::Empty,
                Cow::from(vec![Catch::One { tag, label: 0 }]),
            ),
            Instruction::LocalGet(0),
            Instruction::Call(thrower),
            Instruction::End,
            Instruction::I32Const(-1),
            Instruction::End,
        ],
    );
    let wasm = b.finish();
    assert_all_modes(&wasm, 2, "echo", &[Value::I32(77)], &[Value::I32(77)]);
}

#[test]
fn test_split_bound_does_not_change_behavior() {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(vec![ValType::I32], vec![ValType::I32]);
    let helper = b.func(
        ty,
        None,
        vec![],
        &[
            Instruction::LocalGet(0),
            Instruction::I32Const(3),
            Instruction::I32Mul,
        ],
    );
    b.func(
        ty,
        Some("f"),
        vec![],
        &[
            Instruction::LocalGet(0),
            Instruction::Call(helper),
            Instruction::I32Const(1),
            Instruction::I32Add,
        ],
    );
    let wasm = b.finish();

    for max in [1, 1000] {
        let config = CompilerConfig {
            max_functions_per_unit: max,
            ..CompilerConfig::default()
        };
        let output = compile(&wasm, &config).unwrap();
        assert_eq!(output.units.len(), if max == 1 { 2 } else { 1 });
        let mut machine = output.factory.instantiate(&Imports::new()).unwrap();
        let got = machine.call_export("f", &[Value::I32(5)]).unwrap();
        assert_eq!(got, vec![Value::I32(16)]);
    }
}

fn spin_module() -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(vec![], vec![ValType::I32]);
    b.func(
        ty,
        Some("spin"),
        vec![],
        &[
            Instruction::Loop(BlockType::Empty),
            Instruction::Br(0),
            Instruction::End,
            Instruction::I32Const(0),
        ],
    );
    b.finish()
}

fn assert_cancels(config: &CompilerConfig) {
    let output = compile(&spin_module(), config).unwrap();
    let mut machine = output.factory.instantiate(&Imports::new()).unwrap();
    let token: CancelToken = machine.cancel_token();

    let canceller = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        token.cancel();
    });
    let result = machine.call_export("spin", &[]);
    canceller.join().unwrap();
    assert!(matches!(
        result,
        Err(ExecError::Trap(TrapKind::Cancelled))
    ));
}

#[test]
fn test_cancellation_interrupts_compiled_loop() {
    assert_cancels(&CompilerConfig::default());
}

#[test]
fn test_cancellation_interrupts_interpreted_loop() {
    assert_cancels(&CompilerConfig {
        force_interpret: vec![0],
        ..CompilerConfig::default()
    });
}
