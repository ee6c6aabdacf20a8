//! End-to-end execution tests: compile IR, enter through the native-call
//! stub, and observe statuses, results and memory effects.

#![cfg(all(target_arch = "x86_64", unix))]

use capstan::environ::*;
use capstan::runtime::Trap;
use capstan::{single_function_module, Engine, Instance, Module, Val};

fn invoke0(ty: FunctionType, uses: ResourceUses, ops: Vec<Operation>) -> anyhow::Result<Vec<Val>> {
    let module = single_function_module(ty.clone(), FunctionIr { ty, uses, ops });
    let mut instance = instantiate(&module);
    instance.invoke(0, &[])
}

fn memory_module(ty: FunctionType, ops: Vec<Operation>) -> Module {
    let uses = ResourceUses {
        memory: true,
        ..Default::default()
    };
    let mut module = single_function_module(ty.clone(), FunctionIr { ty, uses, ops });
    module.env.memory = Some(MemoryDecl {
        min_pages: 1,
        max_pages: Some(4),
        shared: false,
    });
    module
}

fn instantiate(module: &Module) -> Instance {
    let _ = env_logger::builder().is_test(true).try_init();
    Engine::new().unwrap().instantiate(module).unwrap()
}

fn expect_trap(result: anyhow::Result<Vec<Val>>, trap: Trap) {
    let err = result.expect_err("expected a trap");
    assert_eq!(err.downcast_ref::<Trap>(), Some(&trap), "{err}");
}

fn i32_result(result: anyhow::Result<Vec<Val>>) -> i32 {
    match result.unwrap().as_slice() {
        [Val::I32(v)] => *v,
        other => panic!("expected one i32, got {other:?}"),
    }
}

fn i64_result(result: anyhow::Result<Vec<Val>>) -> i64 {
    match result.unwrap().as_slice() {
        [Val::I64(v)] => *v,
        other => panic!("expected one i64, got {other:?}"),
    }
}

#[test]
fn returns_a_constant() {
    let ty = FunctionType::new([], [ValType::I32]);
    let got = i32_result(invoke0(
        ty,
        ResourceUses::default(),
        vec![Operation::ConstI32 { value: 100 }],
    ));
    assert_eq!(got, 100);
}

#[test]
fn adds_two_parameters() {
    let ty = FunctionType::new([ValType::I32, ValType::I32], [ValType::I32]);
    // Body entry depth: call-frame offset (2) + frame record (4).
    let module = single_function_module(
        ty.clone(),
        FunctionIr {
            ty,
            uses: ResourceUses::default(),
            ops: vec![
                Operation::Pick {
                    depth: 5,
                    is_target_vector: false,
                },
                Operation::Pick {
                    depth: 5,
                    is_target_vector: false,
                },
                Operation::IAdd { ty: IntTy::I32 },
            ],
        },
    );
    let mut instance = instantiate(&module);
    let got = instance.invoke(0, &[Val::I32(30), Val::I32(12)]).unwrap();
    assert_eq!(got, vec![Val::I32(42)]);

    let wrapped = instance
        .invoke(0, &[Val::I32(i32::MAX), Val::I32(1)])
        .unwrap();
    assert_eq!(wrapped, vec![Val::I32(i32::MIN)]);
}

#[test]
fn integer_division_traps() {
    let ty = FunctionType::new([], [ValType::I32]);
    expect_trap(
        invoke0(
            ty.clone(),
            ResourceUses::default(),
            vec![
                Operation::ConstI32 { value: 1 },
                Operation::ConstI32 { value: 0 },
                Operation::IDiv {
                    ty: IntTy::I32,
                    sign: Sign::Signed,
                },
            ],
        ),
        Trap::IntegerDivisionByZero,
    );
    expect_trap(
        invoke0(
            ty.clone(),
            ResourceUses::default(),
            vec![
                Operation::ConstI32 {
                    value: i32::MIN as u32,
                },
                Operation::ConstI32 { value: -1i32 as u32 },
                Operation::IDiv {
                    ty: IntTy::I32,
                    sign: Sign::Signed,
                },
            ],
        ),
        Trap::IntegerOverflow,
    );
    // MIN % -1 is zero, not a trap.
    let got = i32_result(invoke0(
        ty,
        ResourceUses::default(),
        vec![
            Operation::ConstI32 {
                value: i32::MIN as u32,
            },
            Operation::ConstI32 { value: -1i32 as u32 },
            Operation::IRem {
                ty: IntTy::I32,
                sign: Sign::Signed,
            },
        ],
    ));
    assert_eq!(got, 0);
}

#[test]
fn division_covers_all_shapes() {
    let ty = FunctionType::new([], [ValType::I64]);
    let got = i64_result(invoke0(
        ty.clone(),
        ResourceUses::default(),
        vec![
            Operation::ConstI64 { value: 1000 },
            Operation::ConstI64 { value: 7 },
            Operation::IDiv {
                ty: IntTy::I64,
                sign: Sign::Unsigned,
            },
        ],
    ));
    assert_eq!(got, 142);
    let got = i64_result(invoke0(
        ty,
        ResourceUses::default(),
        vec![
            Operation::ConstI64 {
                value: (-1000i64) as u64,
            },
            Operation::ConstI64 { value: 7 },
            Operation::IRem {
                ty: IntTy::I64,
                sign: Sign::Signed,
            },
        ],
    ));
    assert_eq!(got, -6);
}

#[test]
fn bit_counting_and_rotates() {
    let ty = FunctionType::new([], [ValType::I32]);
    let clz = |v: u32| {
        i32_result(invoke0(
            ty.clone(),
            ResourceUses::default(),
            vec![
                Operation::ConstI32 { value: v },
                Operation::IClz { ty: IntTy::I32 },
            ],
        ))
    };
    assert_eq!(clz(1), 31);
    assert_eq!(clz(0), 32);
    assert_eq!(clz(0x8000_0000), 0);

    let got = i32_result(invoke0(
        ty.clone(),
        ResourceUses::default(),
        vec![
            Operation::ConstI32 { value: 0xf0f0 },
            Operation::IPopcnt { ty: IntTy::I32 },
        ],
    ));
    assert_eq!(got, 8);

    let got = i32_result(invoke0(
        ty,
        ResourceUses::default(),
        vec![
            Operation::ConstI32 { value: 0x8000_0001 },
            Operation::ConstI32 { value: 4 },
            Operation::IRotl { ty: IntTy::I32 },
        ],
    ));
    assert_eq!(got as u32, 0x0000_0018);
}

#[test]
fn comparisons_materialise_and_branch() {
    let ty = FunctionType::new([], [ValType::I32]);
    // A comparison whose flag must be realised before the next push.
    let got = i32_result(invoke0(
        ty.clone(),
        ResourceUses::default(),
        vec![
            Operation::ConstI32 { value: 3 },
            Operation::ConstI32 { value: 5 },
            Operation::ICmp {
                ty: IntTy::I32,
                kind: CmpKind::LtU,
            },
            Operation::ConstI32 { value: 10 },
            Operation::IAdd { ty: IntTy::I32 },
        ],
    ));
    assert_eq!(got, 11);

    // Signedness matters.
    let got = i32_result(invoke0(
        ty,
        ResourceUses::default(),
        vec![
            Operation::ConstI32 {
                value: -1i32 as u32,
            },
            Operation::ConstI32 { value: 1 },
            Operation::ICmp {
                ty: IntTy::I32,
                kind: CmpKind::LtS,
            },
        ],
    ));
    assert_eq!(got, 1);
}

#[test]
fn select_picks_by_condition() {
    let ty = FunctionType::new([], [ValType::I32]);
    let select = |cond: u32| {
        i32_result(invoke0(
            ty.clone(),
            ResourceUses::default(),
            vec![
                Operation::ConstI32 { value: 7 },
                Operation::ConstI32 { value: 9 },
                Operation::ConstI32 { value: cond },
                Operation::Select {
                    is_target_vector: false,
                },
            ],
        ))
    };
    assert_eq!(select(1), 7);
    assert_eq!(select(0), 9);
}

#[test]
fn loop_with_backward_branch_terminates() {
    let ty = FunctionType::new([ValType::I32], [ValType::I32]);
    let header = Label::header(1);
    let cont = Label::continuation(1);
    let module = single_function_module(
        ty.clone(),
        FunctionIr {
            ty,
            uses: ResourceUses::default(),
            ops: vec![
                Operation::Pick {
                    depth: 4,
                    is_target_vector: false,
                },
                Operation::Label { label: header },
                Operation::ConstI32 { value: 1 },
                Operation::ISub { ty: IntTy::I32 },
                Operation::Pick {
                    depth: 0,
                    is_target_vector: false,
                },
                Operation::BrIf {
                    then: BranchTarget::new(header),
                    r#else: BranchTarget::new(cont),
                },
                Operation::Label { label: cont },
                Operation::Drop {
                    range: Some(InclusiveRange { start: 0, end: 0 }),
                },
                Operation::ConstI32 { value: 42 },
            ],
        },
    );
    let mut instance = instantiate(&module);
    assert_eq!(instance.invoke(0, &[Val::I32(5)]).unwrap(), vec![Val::I32(42)]);
    assert_eq!(instance.invoke(0, &[Val::I32(1)]).unwrap(), vec![Val::I32(42)]);
}

#[test]
fn br_table_selects_arms() {
    let ty = FunctionType::new([ValType::I32], [ValType::I32]);
    let (a0, a1, def, merge) = (
        Label::header(10),
        Label::header(11),
        Label::header(12),
        Label::continuation(13),
    );
    let module = single_function_module(
        ty.clone(),
        FunctionIr {
            ty,
            uses: ResourceUses::default(),
            ops: vec![
                Operation::Pick {
                    depth: 4,
                    is_target_vector: false,
                },
                Operation::BrTable {
                    targets: vec![BranchTarget::new(a0), BranchTarget::new(a1)],
                    default: BranchTarget::new(def),
                },
                Operation::Label { label: a0 },
                Operation::ConstI32 { value: 10 },
                Operation::Br {
                    target: BranchTarget::new(merge),
                },
                Operation::Label { label: a1 },
                Operation::ConstI32 { value: 20 },
                Operation::Br {
                    target: BranchTarget::new(merge),
                },
                Operation::Label { label: def },
                Operation::ConstI32 { value: 30 },
                Operation::Br {
                    target: BranchTarget::new(merge),
                },
                Operation::Label { label: merge },
            ],
        },
    );
    let mut instance = instantiate(&module);
    for (index, want) in [(0, 10), (1, 20), (2, 30), (9, 30)] {
        assert_eq!(
            instance.invoke(0, &[Val::I32(index)]).unwrap(),
            vec![Val::I32(want)]
        );
    }
}

#[test]
fn unreachable_reports_its_status() {
    let ty = FunctionType::new([], []);
    expect_trap(
        invoke0(ty, ResourceUses::default(), vec![Operation::Unreachable]),
        Trap::Unreachable,
    );
}

#[test]
fn direct_calls_pass_parameters_and_results() {
    let add_ty = FunctionType::new([ValType::I32, ValType::I32], [ValType::I32]);
    let main_ty = FunctionType::new([], [ValType::I32]);
    let module = Module {
        env: ModuleEnv {
            types: vec![add_ty.clone(), main_ty.clone()],
            functions: vec![0, 1],
            ..Default::default()
        },
        bodies: vec![
            FunctionIr {
                ty: add_ty,
                uses: ResourceUses::default(),
                ops: vec![
                    Operation::Pick {
                        depth: 5,
                        is_target_vector: false,
                    },
                    Operation::Pick {
                        depth: 5,
                        is_target_vector: false,
                    },
                    Operation::IAdd { ty: IntTy::I32 },
                ],
            },
            FunctionIr {
                ty: main_ty,
                uses: ResourceUses {
                    functions: true,
                    ..Default::default()
                },
                ops: vec![
                    Operation::ConstI32 { value: 30 },
                    Operation::ConstI32 { value: 12 },
                    Operation::Call { function_index: 0 },
                ],
            },
        ],
        ..Default::default()
    };
    let mut instance = instantiate(&module);
    assert_eq!(instance.invoke(1, &[]).unwrap(), vec![Val::I32(42)]);
}

#[test]
fn indirect_calls_check_table_and_type() {
    let add_ty = FunctionType::new([ValType::I32, ValType::I32], [ValType::I32]);
    let main_ty = FunctionType::new([ValType::I32], [ValType::I32]);
    let module = Module {
        env: ModuleEnv {
            types: vec![add_ty.clone(), main_ty.clone()],
            functions: vec![0, 1],
            tables: vec![ValType::FuncRef],
            ..Default::default()
        },
        table_limits: vec![(2, None)],
        bodies: vec![
            FunctionIr {
                ty: add_ty,
                uses: ResourceUses::default(),
                ops: vec![
                    Operation::Pick {
                        depth: 5,
                        is_target_vector: false,
                    },
                    Operation::Pick {
                        depth: 5,
                        is_target_vector: false,
                    },
                    Operation::IAdd { ty: IntTy::I32 },
                ],
            },
            FunctionIr {
                ty: main_ty,
                uses: ResourceUses {
                    tables: true,
                    ..Default::default()
                },
                ops: vec![
                    Operation::ConstI32 { value: 40 },
                    Operation::ConstI32 { value: 2 },
                    Operation::Pick {
                        depth: 6,
                        is_target_vector: false,
                    },
                    Operation::CallIndirect {
                        type_index: 0,
                        table_index: 0,
                    },
                ],
            },
        ],
        ..Default::default()
    };
    let mut instance = instantiate(&module);
    instance.set_table_function(0, 0, 0).unwrap();

    assert_eq!(instance.invoke(1, &[Val::I32(0)]).unwrap(), vec![Val::I32(42)]);
    // Empty slot -> invalid access; out of range -> invalid access.
    expect_trap(instance.invoke(1, &[Val::I32(1)]), Trap::InvalidTableAccess);
    expect_trap(instance.invoke(1, &[Val::I32(7)]), Trap::InvalidTableAccess);
}

#[test]
fn value_stack_grows_on_demand() {
    // Push far past the initial stack allocation so the preamble has to
    // bounce through the host to grow the value stack.
    let ty = FunctionType::new([], [ValType::I32]);
    let mut ops = Vec::new();
    for i in 0..600 {
        ops.push(Operation::ConstI32 { value: i });
    }
    ops.push(Operation::Drop {
        range: Some(InclusiveRange { start: 0, end: 599 }),
    });
    ops.push(Operation::ConstI32 { value: 7 });
    let got = i32_result(invoke0(ty, ResourceUses::default(), ops));
    assert_eq!(got, 7);
}

#[test]
fn globals_read_and_write() {
    let ty = FunctionType::new([], [ValType::I64]);
    let mut module = single_function_module(
        ty.clone(),
        FunctionIr {
            ty,
            uses: ResourceUses {
                globals: true,
                ..Default::default()
            },
            ops: vec![
                Operation::GlobalGet { index: 0 },
                Operation::ConstI64 { value: 1 },
                Operation::IAdd { ty: IntTy::I64 },
                Operation::GlobalSet { index: 0 },
                Operation::GlobalGet { index: 0 },
            ],
        },
    );
    module.env.globals = vec![ValType::I64];
    module.global_inits = vec![(41, 0)];
    let mut instance = instantiate(&module);
    assert_eq!(instance.invoke(0, &[]).unwrap(), vec![Val::I64(42)]);
    assert_eq!(instance.invoke(0, &[]).unwrap(), vec![Val::I64(43)]);
}

// ---- floats -----------------------------------------------------------

#[test]
fn float_arithmetic_and_compare() {
    let ty = FunctionType::new([], [ValType::F64]);
    let got = invoke0(
        ty,
        ResourceUses::default(),
        vec![
            Operation::ConstF64 {
                bits: 1.5f64.to_bits(),
            },
            Operation::ConstF64 {
                bits: 2.25f64.to_bits(),
            },
            Operation::FAdd { ty: FloatTy::F64 },
        ],
    )
    .unwrap();
    assert_eq!(got, vec![Val::F64(3.75)]);

    let ty = FunctionType::new([], [ValType::I32]);
    let cmp = |a: f32, b: f32, kind: FloatCmpKind| {
        i32_result(invoke0(
            ty.clone(),
            ResourceUses::default(),
            vec![
                Operation::ConstF32 { bits: a.to_bits() },
                Operation::ConstF32 { bits: b.to_bits() },
                Operation::FCmp {
                    ty: FloatTy::F32,
                    kind,
                },
            ],
        ))
    };
    assert_eq!(cmp(1.0, 2.0, FloatCmpKind::Lt), 1);
    assert_eq!(cmp(2.0, 2.0, FloatCmpKind::Lt), 0);
    assert_eq!(cmp(f32::NAN, 2.0, FloatCmpKind::Lt), 0);
    assert_eq!(cmp(f32::NAN, 2.0, FloatCmpKind::Ne), 1);
    assert_eq!(cmp(2.0, 2.0, FloatCmpKind::Eq), 1);
    assert_eq!(cmp(f32::NAN, f32::NAN, FloatCmpKind::Eq), 0);
}

#[test]
fn float_min_max_handle_nan_and_zero_signs() {
    let ty = FunctionType::new([], [ValType::F32]);
    let min = |a: f32, b: f32| {
        match invoke0(
            ty.clone(),
            ResourceUses::default(),
            vec![
                Operation::ConstF32 { bits: a.to_bits() },
                Operation::ConstF32 { bits: b.to_bits() },
                Operation::FMin { ty: FloatTy::F32 },
            ],
        )
        .unwrap()
        .as_slice()
        {
            [Val::F32(v)] => *v,
            other => panic!("{other:?}"),
        }
    };
    assert_eq!(min(1.0, 2.0), 1.0);
    assert!(min(f32::NAN, 2.0).is_nan());
    assert!(min(-0.0, 0.0).is_sign_negative());
}

#[test]
fn float_to_int_truncation() {
    let ty = FunctionType::new([], [ValType::I32]);
    let trunc = |bits: u32, sign: Sign, saturating: bool| {
        invoke0(
            ty.clone(),
            ResourceUses::default(),
            vec![
                Operation::ConstF32 { bits },
                Operation::ITruncF {
                    int: IntTy::I32,
                    float: FloatTy::F32,
                    sign,
                    saturating,
                },
            ],
        )
    };
    assert_eq!(i32_result(trunc(3.7f32.to_bits(), Sign::Signed, false)), 3);
    assert_eq!(
        i32_result(trunc((-3.7f32).to_bits(), Sign::Signed, false)),
        -3
    );
    expect_trap(
        trunc(f32::NAN.to_bits(), Sign::Signed, false),
        Trap::InvalidFloatToIntConversion,
    );
    expect_trap(
        trunc(3e9f32.to_bits(), Sign::Signed, false),
        Trap::IntegerOverflow,
    );
    // Saturating variants clamp and squash NaN to zero.
    assert_eq!(i32_result(trunc(f32::NAN.to_bits(), Sign::Signed, true)), 0);
    assert_eq!(
        i32_result(trunc(3e9f32.to_bits(), Sign::Signed, true)),
        i32::MAX
    );
    assert_eq!(
        i32_result(trunc((-3e9f32).to_bits(), Sign::Signed, true)),
        i32::MIN
    );
    assert_eq!(
        i32_result(trunc(3e9f32.to_bits(), Sign::Unsigned, false)) as u32,
        3_000_000_000u32
    );
    expect_trap(
        trunc((-1.5f32).to_bits(), Sign::Unsigned, false),
        Trap::IntegerOverflow,
    );
    assert_eq!(i32_result(trunc((-0.5f32).to_bits(), Sign::Unsigned, false)), 0);
}

#[test]
fn int_to_float_and_reinterpret_round_trip() {
    let ty = FunctionType::new([], [ValType::F64]);
    let got = invoke0(
        ty,
        ResourceUses::default(),
        vec![
            Operation::ConstI64 {
                value: u64::MAX - 1,
            },
            Operation::FConvertI {
                float: FloatTy::F64,
                int: IntTy::I64,
                sign: Sign::Unsigned,
            },
        ],
    )
    .unwrap();
    assert_eq!(got, vec![Val::F64((u64::MAX - 1) as f64)]);

    let ty = FunctionType::new([], [ValType::F32]);
    let bits = 0x4048_f5c3u32; // 3.14
    let got = invoke0(
        ty,
        ResourceUses::default(),
        vec![
            Operation::ConstF32 { bits },
            Operation::I32ReinterpretF32,
            Operation::F32ReinterpretI32,
        ],
    )
    .unwrap();
    assert_eq!(got, vec![Val::F32(f32::from_bits(bits))]);
}

// ---- linear memory ----------------------------------------------------

#[test]
fn loads_decode_little_endian_at_every_width() {
    let marker = 0x12_34_56_78_9a_bc_ef_feu64;
    let ty = FunctionType::new([], [ValType::I64]);
    let load = |op: Operation| {
        let module = memory_module(ty.clone(), vec![Operation::ConstI32 { value: 0 }, op]);
        let mut instance = instantiate(&module);
        instance.write_memory(0, &marker.to_le_bytes()).unwrap();
        i64_result(instance.invoke(0, &[]))
    };
    assert_eq!(
        load(Operation::Load {
            ty: ValType::I64,
            arg: MemArg::default(),
        }),
        marker as i64
    );
    assert_eq!(
        load(Operation::Load8 {
            ty: IntTy::I64,
            sign: Sign::Unsigned,
            arg: MemArg::default(),
        }),
        0xfe
    );
    assert_eq!(
        load(Operation::Load8 {
            ty: IntTy::I64,
            sign: Sign::Signed,
            arg: MemArg::default(),
        }),
        -2
    );
    assert_eq!(
        load(Operation::Load16 {
            ty: IntTy::I64,
            sign: Sign::Unsigned,
            arg: MemArg::default(),
        }),
        0xeffe
    );
    assert_eq!(
        load(Operation::Load32 {
            sign: Sign::Unsigned,
            arg: MemArg::default(),
        }),
        0x9abc_effe
    );

    let ty32 = FunctionType::new([], [ValType::I32]);
    let module = memory_module(
        ty32,
        vec![
            Operation::ConstI32 { value: 0 },
            Operation::Load {
                ty: ValType::I32,
                arg: MemArg::default(),
            },
        ],
    );
    let mut instance = instantiate(&module);
    instance.write_memory(0, &marker.to_le_bytes()).unwrap();
    assert_eq!(i32_result(instance.invoke(0, &[])) as u32, 0x9abc_effe);
}

#[test]
fn stores_write_back_and_static_offsets_apply() {
    let ty = FunctionType::new([], []);
    let module = memory_module(
        ty,
        vec![
            Operation::ConstI32 { value: 8 },
            Operation::ConstI32 { value: 0x1122_3344 },
            Operation::Store {
                ty: ValType::I32,
                arg: MemArg { offset: 4, align: 2 },
            },
        ],
    );
    let mut instance = instantiate(&module);
    instance.invoke(0, &[]).unwrap();
    assert_eq!(
        instance.read_memory(12, 4).unwrap(),
        0x1122_3344u32.to_le_bytes()
    );
}

#[test]
fn out_of_bounds_accesses_trap() {
    let ty = FunctionType::new([], [ValType::I32]);
    let load_at = |base: u32, offset: u32| {
        let module = memory_module(
            ty.clone(),
            vec![
                Operation::ConstI32 { value: base },
                Operation::Load {
                    ty: ValType::I32,
                    arg: MemArg { offset, align: 2 },
                },
            ],
        );
        instantiate(&module).invoke(0, &[])
    };
    assert!(load_at(65532, 0).is_ok());
    expect_trap(load_at(65533, 0), Trap::MemoryOutOfBounds);
    expect_trap(load_at(65536, 0), Trap::MemoryOutOfBounds);
    // The bounds check is 64-bit; u32 wraparound cannot slip through.
    expect_trap(load_at(u32::MAX, 8), Trap::MemoryOutOfBounds);
}

#[test]
fn memory_size_and_grow_round_trip() {
    let ty = FunctionType::new([], [ValType::I32]);
    let module = memory_module(
        ty.clone(),
        vec![
            Operation::ConstI32 { value: 1 },
            Operation::MemoryGrow,
            // Execution continues after the bounce: old size + 100.
            Operation::ConstI32 { value: 100 },
            Operation::IAdd { ty: IntTy::I32 },
        ],
    );
    let mut instance = instantiate(&module);
    assert_eq!(instance.invoke(0, &[]).unwrap(), vec![Val::I32(101)]);
    assert_eq!(instance.memory_pages(), Some(2));

    let module = memory_module(ty, vec![Operation::MemorySize]);
    let mut instance = instantiate(&module);
    assert_eq!(instance.invoke(0, &[]).unwrap(), vec![Val::I32(1)]);
}

#[test]
fn memory_copy_is_overlap_safe_and_bounds_checked() {
    let ty = FunctionType::new([], []);
    let module = memory_module(
        ty.clone(),
        vec![
            Operation::ConstI32 { value: 777 },
            Operation::ConstI32 { value: 1 },
            Operation::ConstI32 { value: 10000 },
            Operation::MemoryCopy,
        ],
    );
    let mut instance = instantiate(&module);
    let pattern: Vec<u8> = (0..10001u32).map(|i| (i * 7) as u8).collect();
    instance.write_memory(0, &pattern).unwrap();
    let before = instance.read_memory(1, 10000).unwrap();
    instance.invoke(0, &[]).unwrap();
    assert_eq!(instance.read_memory(777, 10000).unwrap(), before);

    let module = memory_module(
        ty,
        vec![
            Operation::ConstI32 { value: 0 },
            Operation::ConstI32 { value: 65536 },
            Operation::ConstI32 { value: 1 },
            Operation::MemoryCopy,
        ],
    );
    expect_trap(instantiate(&module).invoke(0, &[]), Trap::MemoryOutOfBounds);
}

#[test]
fn memory_fill_and_init_and_data_drop() {
    let ty = FunctionType::new([], []);
    let module = memory_module(
        ty.clone(),
        vec![
            Operation::ConstI32 { value: 10 },
            Operation::ConstI32 { value: 0x41 },
            Operation::ConstI32 { value: 5 },
            Operation::MemoryFill,
        ],
    );
    let mut instance = instantiate(&module);
    instance.invoke(0, &[]).unwrap();
    assert_eq!(instance.read_memory(10, 5).unwrap(), b"AAAAA");

    let mut module = memory_module(
        ty.clone(),
        vec![
            Operation::ConstI32 { value: 3 },
            Operation::ConstI32 { value: 0 },
            Operation::ConstI32 { value: 5 },
            Operation::MemoryInit { data_index: 0 },
        ],
    );
    module.env.data_count = 1;
    module.data_segments = vec![b"hello".to_vec()];
    module.bodies[0].uses.data_instances = true;
    let mut instance = instantiate(&module);
    instance.invoke(0, &[]).unwrap();
    assert_eq!(instance.read_memory(3, 5).unwrap(), b"hello");

    // After data.drop, the same init is out of range.
    let mut module = memory_module(
        ty,
        vec![
            Operation::DataDrop { data_index: 0 },
            Operation::ConstI32 { value: 3 },
            Operation::ConstI32 { value: 0 },
            Operation::ConstI32 { value: 5 },
            Operation::MemoryInit { data_index: 0 },
        ],
    );
    module.env.data_count = 1;
    module.data_segments = vec![b"hello".to_vec()];
    module.bodies[0].uses.data_instances = true;
    expect_trap(instantiate(&module).invoke(0, &[]), Trap::MemoryOutOfBounds);
}

// ---- tables and references --------------------------------------------

#[test]
fn table_get_set_size_and_ref_func() {
    let ty = FunctionType::new([], [ValType::FuncRef]);
    let mut module = single_function_module(
        ty.clone(),
        FunctionIr {
            ty: ty.clone(),
            uses: ResourceUses {
                tables: true,
                ..Default::default()
            },
            ops: vec![
                Operation::ConstI32 { value: 1 },
                Operation::TableGet { table_index: 0 },
            ],
        },
    );
    module.env.tables = vec![ValType::FuncRef];
    module.table_limits = vec![(2, None)];
    let mut instance = instantiate(&module);
    instance.set_table_function(0, 1, 0).unwrap();
    let addr = instance.module().function_record_addr(0).unwrap();
    assert_eq!(instance.invoke(0, &[]).unwrap(), vec![Val::FuncRef(addr)]);

    let mut module = single_function_module(
        ty.clone(),
        FunctionIr {
            ty,
            uses: ResourceUses::default(),
            ops: vec![Operation::RefFunc { function_index: 0 }],
        },
    );
    module.env.tables = vec![];
    let mut instance = instantiate(&module);
    let addr = instance.module().function_record_addr(0).unwrap();
    assert_eq!(instance.invoke(0, &[]).unwrap(), vec![Val::FuncRef(addr)]);

    let size_ty = FunctionType::new([], [ValType::I32]);
    let mut module = single_function_module(
        size_ty.clone(),
        FunctionIr {
            ty: size_ty,
            uses: ResourceUses {
                tables: true,
                ..Default::default()
            },
            ops: vec![Operation::TableSize { table_index: 0 }],
        },
    );
    module.env.tables = vec![ValType::FuncRef];
    module.table_limits = vec![(3, None)];
    assert_eq!(
        instantiate(&module).invoke(0, &[]).unwrap(),
        vec![Val::I32(3)]
    );
}

#[test]
fn table_get_out_of_bounds_traps() {
    let ty = FunctionType::new([], [ValType::FuncRef]);
    let mut module = single_function_module(
        ty.clone(),
        FunctionIr {
            ty,
            uses: ResourceUses {
                tables: true,
                ..Default::default()
            },
            ops: vec![
                Operation::ConstI32 { value: 9 },
                Operation::TableGet { table_index: 0 },
            ],
        },
    );
    module.env.tables = vec![ValType::FuncRef];
    module.table_limits = vec![(2, None)];
    expect_trap(instantiate(&module).invoke(0, &[]), Trap::InvalidTableAccess);
}

// ---- atomics ----------------------------------------------------------

#[test]
fn atomic_rmw_family() {
    let ty = FunctionType::new([], [ValType::I32]);
    let rmw = |op: AtomicRmwOp, initial: u32, operand: u32| {
        let module = memory_module(
            ty.clone(),
            vec![
                Operation::ConstI32 { value: 0 },
                Operation::ConstI32 { value: operand },
                Operation::AtomicRmw {
                    ty: IntTy::I32,
                    width_bits: 32,
                    op,
                    arg: MemArg { offset: 0, align: 2 },
                },
            ],
        );
        let mut instance = instantiate(&module);
        instance.write_memory(0, &initial.to_le_bytes()).unwrap();
        let old = i32_result(instance.invoke(0, &[]));
        let now = u32::from_le_bytes(instance.read_memory(0, 4).unwrap().try_into().unwrap());
        (old as u32, now)
    };
    assert_eq!(rmw(AtomicRmwOp::Add, 10, 5), (10, 15));
    assert_eq!(rmw(AtomicRmwOp::Sub, 10, 4), (10, 6));
    assert_eq!(rmw(AtomicRmwOp::And, 0b1100, 0b1010), (0b1100, 0b1000));
    assert_eq!(rmw(AtomicRmwOp::Or, 0b1100, 0b1010), (0b1100, 0b1110));
    assert_eq!(rmw(AtomicRmwOp::Xor, 0b1100, 0b1010), (0b1100, 0b0110));
    assert_eq!(rmw(AtomicRmwOp::Xchg, 7, 9), (7, 9));
}

#[test]
fn atomic_cmpxchg_and_alignment() {
    let ty = FunctionType::new([], [ValType::I32]);
    let module = memory_module(
        ty.clone(),
        vec![
            Operation::ConstI32 { value: 0 },
            Operation::ConstI32 { value: 5 },
            Operation::ConstI32 { value: 9 },
            Operation::AtomicCmpxchg {
                ty: IntTy::I32,
                width_bits: 32,
                arg: MemArg { offset: 0, align: 2 },
            },
        ],
    );
    let mut instance = instantiate(&module);
    instance.write_memory(0, &5u32.to_le_bytes()).unwrap();
    assert_eq!(instance.invoke(0, &[]).unwrap(), vec![Val::I32(5)]);
    assert_eq!(instance.read_memory(0, 4).unwrap(), 9u32.to_le_bytes());
    // Second round: expected no longer matches, memory unchanged.
    assert_eq!(instance.invoke(0, &[]).unwrap(), vec![Val::I32(9)]);
    assert_eq!(instance.read_memory(0, 4).unwrap(), 9u32.to_le_bytes());

    let module = memory_module(
        ty,
        vec![
            Operation::ConstI32 { value: 2 },
            Operation::AtomicLoad {
                ty: IntTy::I32,
                width_bits: 32,
                arg: MemArg { offset: 0, align: 2 },
            },
        ],
    );
    let mut instance = instantiate(&module);
    instance.write_memory(0, &1u64.to_le_bytes()).unwrap();
    expect_trap(instance.invoke(0, &[]), Trap::UnalignedAtomic);
}

#[test]
fn atomic_load_store_and_fence() {
    let ty = FunctionType::new([], [ValType::I64]);
    let module = memory_module(
        ty,
        vec![
            Operation::ConstI32 { value: 8 },
            Operation::ConstI64 {
                value: 0xdead_beef_cafe_f00d,
            },
            Operation::AtomicStore {
                ty: IntTy::I64,
                width_bits: 64,
                arg: MemArg { offset: 0, align: 3 },
            },
            Operation::AtomicFence,
            Operation::ConstI32 { value: 8 },
            Operation::AtomicLoad {
                ty: IntTy::I64,
                width_bits: 64,
                arg: MemArg { offset: 0, align: 3 },
            },
        ],
    );
    let got = i64_result(instantiate(&module).invoke(0, &[]));
    assert_eq!(got as u64, 0xdead_beef_cafe_f00d);
}

// ---- v128 -------------------------------------------------------------

#[test]
fn v128_any_true_on_a_half_set_vector() {
    let ty = FunctionType::new([], [ValType::I32]);
    let got = i32_result(invoke0(
        ty,
        ResourceUses::default(),
        vec![
            Operation::ConstV128 {
                lo: 0,
                hi: u64::MAX,
            },
            Operation::V128AnyTrue,
        ],
    ));
    assert_eq!(got, 1);
}

#[test]
fn v128_saturating_byte_add() {
    let ty = FunctionType::new([], [ValType::I32]);
    let sat = |sign: Sign, extract_sign: Sign| {
        i32_result(invoke0(
            ty.clone(),
            ResourceUses::default(),
            vec![
                Operation::ConstV128 {
                    lo: 0x7f7f_7f7f_7f7f_7f7f,
                    hi: 0x7f7f_7f7f_7f7f_7f7f,
                },
                Operation::ConstV128 {
                    lo: 0x0101_0101_0101_0101,
                    hi: 0x0101_0101_0101_0101,
                },
                Operation::V128AddSat {
                    shape: VecShape::I8x16,
                    sign,
                },
                Operation::V128ExtractLane {
                    shape: VecShape::I8x16,
                    lane: 3,
                    sign: extract_sign,
                },
            ],
        ))
    };
    // Signed saturation clamps at 127; unsigned addition reaches 128.
    assert_eq!(sat(Sign::Signed, Sign::Signed), 127);
    assert_eq!(sat(Sign::Unsigned, Sign::Unsigned), 128);
}

#[test]
fn v128_lane_round_trips() {
    let ty = FunctionType::new([], [ValType::I64]);
    let got = i64_result(invoke0(
        ty,
        ResourceUses::default(),
        vec![
            Operation::ConstV128 { lo: 1, hi: 2 },
            Operation::ConstI64 { value: 0x55aa },
            Operation::V128ReplaceLane {
                shape: VecShape::I64x2,
                lane: 1,
            },
            Operation::V128ExtractLane {
                shape: VecShape::I64x2,
                lane: 1,
                sign: Sign::Unsigned,
            },
        ],
    ));
    assert_eq!(got, 0x55aa);
}


#[test]
fn v128_splat_arithmetic_and_all_true() {
    let ty = FunctionType::new([], [ValType::I32]);
    let got = i32_result(invoke0(
        ty.clone(),
        ResourceUses::default(),
        vec![
            Operation::ConstI32 { value: 7 },
            Operation::V128Splat {
                shape: VecShape::I32x4,
            },
            Operation::ConstI32 { value: 5 },
            Operation::V128Splat {
                shape: VecShape::I32x4,
            },
            Operation::V128Add {
                shape: VecShape::I32x4,
            },
            Operation::V128ExtractLane {
                shape: VecShape::I32x4,
                lane: 2,
                sign: Sign::Unsigned,
            },
        ],
    ));
    assert_eq!(got, 12);

    let all = |lo: u64, hi: u64| {
        i32_result(invoke0(
            ty.clone(),
            ResourceUses::default(),
            vec![
                Operation::ConstV128 { lo, hi },
                Operation::V128AllTrue {
                    shape: VecShape::I32x4,
                },
            ],
        ))
    };
    assert_eq!(all(0x1_0000_0001, 0x1_0000_0001), 1);
    assert_eq!(all(0x1_0000_0000, 0x1_0000_0001), 0);
}

#[test]
fn v128_bitmask_and_compare() {
    let ty = FunctionType::new([], [ValType::I32]);
    let got = i32_result(invoke0(
        ty.clone(),
        ResourceUses::default(),
        vec![
            Operation::ConstV128 {
                lo: 0x8000_0000_0000_0000,
                hi: 0x8000_0000_0000_0001,
            },
            Operation::V128Bitmask {
                shape: VecShape::I32x4,
            },
        ],
    ));
    // Sign bits in lanes 1 and 3.
    assert_eq!(got, 0b1010);

    let got = i32_result(invoke0(
        ty,
        ResourceUses::default(),
        vec![
            Operation::ConstV128 {
                lo: 0x0000_0002_0000_0001,
                hi: 0x0000_0004_0000_0003,
            },
            Operation::ConstV128 {
                lo: 0x0000_0002_0000_0002,
                hi: 0x0000_0001_0000_0003,
            },
            Operation::V128Cmp {
                shape: VecShape::I32x4,
                kind: CmpKind::LtU,
            },
            Operation::V128Bitmask {
                shape: VecShape::I32x4,
            },
        ],
    ));
    // Lane 0: 1 < 2; lanes 1, 2 equal; lane 3: 4 > 1.
    assert_eq!(got, 0b0001);
}

#[test]
fn v128_mul_and_i64x2_synthesis() {
    let ty = FunctionType::new([], [ValType::I64]);
    let got = i64_result(invoke0(
        ty,
        ResourceUses::default(),
        vec![
            Operation::ConstV128 {
                lo: 0x1_0000_0001,
                hi: 3,
            },
            Operation::ConstV128 {
                lo: 0x10,
                hi: 0x100,
            },
            Operation::V128Mul {
                shape: VecShape::I64x2,
            },
            Operation::V128ExtractLane {
                shape: VecShape::I64x2,
                lane: 0,
                sign: Sign::Unsigned,
            },
        ],
    ));
    assert_eq!(got as u64, 0x10_0000_0010);
}

#[test]
fn v128_trunc_sat_squashes_nan() {
    let ty = FunctionType::new([], [ValType::I32]);
    let lane = |value: f32, lane: u8| {
        let bits = value.to_bits() as u64;
        i32_result(invoke0(
            ty.clone(),
            ResourceUses::default(),
            vec![
                Operation::ConstV128 {
                    lo: bits | (f32::NAN.to_bits() as u64) << 32,
                    hi: (3e10f32.to_bits() as u64) | ((-7.5f32).to_bits() as u64) << 32,
                },
                Operation::V128TruncSat {
                    shape: VecShape::F32x4,
                    sign: Sign::Signed,
                },
                Operation::V128ExtractLane {
                    shape: VecShape::I32x4,
                    lane,
                    sign: Sign::Unsigned,
                },
            ],
        ))
    };
    assert_eq!(lane(41.9, 0), 41);
    assert_eq!(lane(41.9, 1), 0); // NaN lane
    assert_eq!(lane(41.9, 2), i32::MAX); // overflow lane saturates
    assert_eq!(lane(41.9, 3), -7);
}

#[test]
fn v128_narrow_then_extend_is_identity_in_range() {
    let ty = FunctionType::new([], [ValType::I32]);
    let lanes = Operation::ConstV128 {
        lo: 0x0004_0003_0002_0001,
        hi: 0x0008_0007_0006_0005,
    };
    let got = i32_result(invoke0(
        ty,
        ResourceUses::default(),
        vec![
            lanes.clone(),
            lanes,
            Operation::V128Narrow {
                shape: VecShape::I16x8,
                sign: Sign::Signed,
            },
            Operation::V128Extend {
                shape: VecShape::I8x16,
                sign: Sign::Signed,
                low: true,
            },
            Operation::V128ExtractLane {
                shape: VecShape::I16x8,
                lane: 3,
                sign: Sign::Signed,
            },
        ],
    ));
    assert_eq!(got, 4);
}

#[test]
fn v128_memory_round_trip() {
    let ty = FunctionType::new([], []);
    let module = memory_module(
        ty,
        vec![
            Operation::ConstI32 { value: 32 },
            Operation::ConstI32 { value: 0 },
            Operation::V128Load {
                kind: V128LoadKind::V128,
                arg: MemArg::default(),
            },
            Operation::V128Store {
                arg: MemArg::default(),
            },
        ],
    );
    let mut instance = instantiate(&module);
    let pattern: Vec<u8> = (0u8..16).collect();
    instance.write_memory(0, &pattern).unwrap();
    instance.invoke(0, &[]).unwrap();
    assert_eq!(instance.read_memory(32, 16).unwrap(), pattern);
}
