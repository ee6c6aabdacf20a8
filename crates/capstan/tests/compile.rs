//! Cross-ISA compile tests: both back ends must lower every operation
//! family on any host.

use capstan::environ::*;
use capstan::lookup;

fn triples() -> Vec<target_lexicon::Triple> {
    vec![
        "x86_64-unknown-linux-gnu".parse().unwrap(),
        "aarch64-unknown-linux-gnu".parse().unwrap(),
    ]
}

fn env_with_everything() -> ModuleEnv {
    ModuleEnv {
        types: vec![
            FunctionType::new([], [ValType::I32]),
            FunctionType::new([ValType::I32, ValType::I32], [ValType::I32]),
        ],
        functions: vec![0, 1],
        globals: vec![ValType::I64, ValType::V128],
        tables: vec![ValType::FuncRef],
        memory: Some(MemoryDecl {
            min_pages: 1,
            max_pages: None,
            shared: true,
        }),
        data_count: 1,
        element_count: 1,
    }
}

fn all_uses() -> ResourceUses {
    ResourceUses {
        memory: true,
        globals: true,
        tables: true,
        functions: true,
        data_instances: true,
        element_instances: true,
    }
}

/// One operation of every lowering family, in a stack-coherent order.
fn kitchen_sink_ops() -> Vec<Operation> {
    use Operation::*;
    let m = MemArg::default();
    let aligned = MemArg { offset: 0, align: 2 };
    vec![
        // Scalar integer.
        ConstI32 { value: 1 },
        ConstI32 { value: 2 },
        IAdd { ty: IntTy::I32 },
        ConstI32 { value: 3 },
        IMul { ty: IntTy::I32 },
        ConstI32 { value: 2 },
        IDiv { ty: IntTy::I32, sign: Sign::Unsigned },
        ConstI32 { value: 7 },
        IRem { ty: IntTy::I32, sign: Sign::Signed },
        ConstI32 { value: 1 },
        IShl { ty: IntTy::I32 },
        ConstI32 { value: 1 },
        IShr { ty: IntTy::I32, sign: Sign::Signed },
        ConstI32 { value: 3 },
        IRotr { ty: IntTy::I32 },
        IClz { ty: IntTy::I32 },
        ICtz { ty: IntTy::I32 },
        IPopcnt { ty: IntTy::I32 },
        IEqz { ty: IntTy::I32 },
        I64ExtendI32 { sign: Sign::Unsigned },
        SignExtend { ty: IntTy::I64, from_bits: 8 },
        I32WrapI64,
        // Floats and conversions.
        FConvertI { float: FloatTy::F64, int: IntTy::I32, sign: Sign::Signed },
        FSqrt { ty: FloatTy::F64 },
        FCeil { ty: FloatTy::F64 },
        ConstF64 { bits: 2.0f64.to_bits() },
        FCopysign { ty: FloatTy::F64 },
        ConstF64 { bits: 1.0f64.to_bits() },
        FMax { ty: FloatTy::F64 },
        F32DemoteF64,
        F64PromoteF32,
        I64ReinterpretF64,
        ConstF32 { bits: 5.5f32.to_bits() },
        ITruncF { int: IntTy::I32, float: FloatTy::F32, sign: Sign::Unsigned, saturating: true },
        Drop { range: Some(InclusiveRange { start: 0, end: 1 }) },
        // Memory.
        ConstI32 { value: 0 },
        Load { ty: ValType::I32, arg: m },
        ConstI32 { value: 0 },
        Load16 { ty: IntTy::I32, sign: Sign::Signed, arg: m },
        Store16 { ty: IntTy::I32, arg: m },
        MemorySize,
        MemoryGrow,
        Drop { range: Some(InclusiveRange { start: 0, end: 0 }) },
        ConstI32 { value: 0 },
        ConstI32 { value: 0 },
        ConstI32 { value: 4 },
        MemoryCopy,
        ConstI32 { value: 0 },
        ConstI32 { value: 0 },
        ConstI32 { value: 4 },
        MemoryFill,
        ConstI32 { value: 0 },
        ConstI32 { value: 0 },
        ConstI32 { value: 1 },
        MemoryInit { data_index: 0 },
        DataDrop { data_index: 0 },
        // Globals, tables, references.
        GlobalGet { index: 0 },
        GlobalSet { index: 0 },
        GlobalGet { index: 1 },
        GlobalSet { index: 1 },
        RefFunc { function_index: 0 },
        ConstI32 { value: 0 },
        Swap { depth: 1, is_target_vector: false },
        TableSet { table_index: 0 },
        ConstI32 { value: 0 },
        TableGet { table_index: 0 },
        Drop { range: Some(InclusiveRange { start: 0, end: 0 }) },
        TableSize { table_index: 0 },
        Drop { range: Some(InclusiveRange { start: 0, end: 0 }) },
        ConstI32 { value: 0 },
        ConstI32 { value: 0 },
        ConstI32 { value: 1 },
        TableInit { elem_index: 0, table_index: 0 },
        ConstI32 { value: 0 },
        ConstI32 { value: 0 },
        ConstI32 { value: 1 },
        TableCopy { dst_table: 0, src_table: 0 },
        ElemDrop { elem_index: 0 },
        // Atomics.
        ConstI32 { value: 0 },
        AtomicLoad { ty: IntTy::I32, width_bits: 32, arg: aligned },
        ConstI32 { value: 0 },
        Swap { depth: 1, is_target_vector: false },
        AtomicStore { ty: IntTy::I32, width_bits: 32, arg: aligned },
        ConstI32 { value: 0 },
        ConstI32 { value: 1 },
        AtomicRmw { ty: IntTy::I32, width_bits: 32, op: AtomicRmwOp::Xor, arg: aligned },
        ConstI32 { value: 0 },
        Swap { depth: 1, is_target_vector: false },
        ConstI32 { value: 9 },
        AtomicCmpxchg { ty: IntTy::I32, width_bits: 32, arg: aligned },
        AtomicFence,
        Drop { range: Some(InclusiveRange { start: 0, end: 0 }) },
        // Vectors.
        ConstV128 { lo: 1, hi: 2 },
        ConstV128 { lo: 3, hi: 4 },
        V128Add { shape: VecShape::I64x2 },
        ConstV128 { lo: 5, hi: 6 },
        V128Mul { shape: VecShape::I64x2 },
        ConstV128 { lo: 7, hi: 8 },
        V128Min { shape: VecShape::I8x16, sign: Sign::Signed },
        ConstV128 { lo: 9, hi: 10 },
        V128Max { shape: VecShape::F32x4, sign: Sign::Signed },
        V128Neg { shape: VecShape::I32x4 },
        V128Abs { shape: VecShape::I64x2 },
        ConstI32 { value: 3 },
        V128Shl { shape: VecShape::I8x16 },
        ConstI32 { value: 3 },
        V128Shr { shape: VecShape::I8x16, sign: Sign::Signed },
        ConstI32 { value: 1 },
        V128Shr { shape: VecShape::I64x2, sign: Sign::Signed },
        ConstV128 { lo: 11, hi: 12 },
        V128Cmp { shape: VecShape::I64x2, kind: CmpKind::LtU },
        ConstV128 { lo: 13, hi: 14 },
        V128AvgrU { shape: VecShape::I16x8 },
        ConstV128 { lo: 15, hi: 16 },
        V128SubSat { shape: VecShape::I16x8, sign: Sign::Unsigned },
        ConstV128 { lo: 17, hi: 18 },
        V128Narrow { shape: VecShape::I16x8, sign: Sign::Signed },
        V128Extend { shape: VecShape::I8x16, sign: Sign::Signed, low: false },
        V128ExtAddPairwise { shape: VecShape::I8x16, sign: Sign::Unsigned },
        ConstV128 { lo: 19, hi: 20 },
        V128ExtMul { shape: VecShape::I16x8, sign: Sign::Signed, low: true },
        ConstV128 { lo: 21, hi: 22 },
        V128Q15MulrSatS,
        ConstV128 { lo: 23, hi: 24 },
        V128Dot,
        V128Popcnt,
        ConstV128 { lo: 25, hi: 26 },
        V128Shuffle {
            lanes: [0, 17, 2, 19, 4, 21, 6, 23, 8, 25, 10, 27, 12, 29, 14, 31],
        },
        ConstV128 { lo: 27, hi: 28 },
        V128Swizzle,
        V128Not,
        ConstV128 { lo: 29, hi: 30 },
        V128AndNot,
        ConstV128 { lo: 31, hi: 32 },
        ConstV128 { lo: 33, hi: 34 },
        V128Bitselect,
        V128AnyTrue,
        Drop { range: Some(InclusiveRange { start: 0, end: 0 }) },
        ConstV128 { lo: 35, hi: 36 },
        V128AllTrue { shape: VecShape::I16x8 },
        Drop { range: Some(InclusiveRange { start: 0, end: 0 }) },
        ConstV128 { lo: 37, hi: 38 },
        V128Bitmask { shape: VecShape::I8x16 },
        Drop { range: Some(InclusiveRange { start: 0, end: 0 }) },
        ConstV128 { lo: 39, hi: 40 },
        V128TruncSat { shape: VecShape::F64x2, sign: Sign::Unsigned },
        V128FConvertI { float: VecShape::F32x4, sign: Sign::Unsigned },
        V128Demote,
        V128Promote,
        Drop { range: Some(InclusiveRange { start: 0, end: 1 }) },
        ConstI32 { value: 0 },
        V128Load { kind: V128LoadKind::S16x4 { sign: Sign::Signed }, arg: m },
        Drop { range: Some(InclusiveRange { start: 0, end: 1 }) },
        ConstI32 { value: 0 },
        V128Load { kind: V128LoadKind::Splat { lane_bits: 8 }, arg: m },
        Drop { range: Some(InclusiveRange { start: 0, end: 1 }) },
        ConstI32 { value: 0 },
        ConstV128 { lo: 43, hi: 44 },
        V128LoadLane { lane_bits: 32, lane: 1, arg: m },
        Drop { range: Some(InclusiveRange { start: 0, end: 1 }) },
        ConstI32 { value: 16 },
        ConstV128 { lo: 45, hi: 46 },
        V128StoreLane { lane_bits: 64, lane: 0, arg: m },
        ConstI32 { value: 16 },
        ConstV128 { lo: 47, hi: 48 },
        V128Store { arg: m },
        ConstV128 { lo: 41, hi: 42 },
        V128ExtractLane { shape: VecShape::F64x2, lane: 1, sign: Sign::Signed },
        Drop { range: Some(InclusiveRange { start: 0, end: 0 }) },
        // Result.
        ConstI32 { value: 0 },
    ]
}

#[test]
fn every_operation_family_compiles_on_both_isas() {
    let env = env_with_everything();
    let ir = FunctionIr {
        ty: env.types[0].clone(),
        uses: all_uses(),
        ops: kitchen_sink_ops(),
    };
    for triple in triples() {
        let isa = lookup(triple.clone()).unwrap();
        let compiled = isa
            .compile_function(&env, &ir)
            .unwrap_or_else(|e| panic!("{triple}: {e:#}"));
        assert!(!compiled.code.is_empty());
        assert!(compiled.stack_pointer_ceil > 0);
    }
}

#[test]
fn calls_emit_relocations() {
    let env = env_with_everything();
    let ir = FunctionIr {
        ty: env.types[0].clone(),
        uses: all_uses(),
        ops: vec![
            Operation::ConstI32 { value: 1 },
            Operation::ConstI32 { value: 2 },
            Operation::Call { function_index: 1 },
        ],
    };
    for triple in triples() {
        let isa = lookup(triple).unwrap();
        let compiled = isa.compile_function(&env, &ir).unwrap();
        assert_eq!(compiled.relocs.len(), 1);
    }
}

#[test]
fn compile_time_errors_surface() {
    let env = env_with_everything();
    // Out-of-range global index.
    let ir = FunctionIr {
        ty: env.types[0].clone(),
        uses: all_uses(),
        ops: vec![Operation::GlobalGet { index: 99 }],
    };
    for triple in triples() {
        let isa = lookup(triple).unwrap();
        assert!(isa.compile_function(&env, &ir).is_err());
    }
}

#[test]
fn branch_shape_mismatches_are_rejected() {
    let env = env_with_everything();
    let header = Label::header(1);
    // The second arrival carries a deeper stack than the snapshot.
    let ir = FunctionIr {
        ty: env.types[0].clone(),
        uses: all_uses(),
        ops: vec![
            Operation::ConstI32 { value: 1 },
            Operation::Label { label: header },
            Operation::ConstI32 { value: 2 },
            Operation::Pick {
                depth: 0,
                is_target_vector: false,
            },
            Operation::BrIf {
                then: BranchTarget::new(header),
                r#else: BranchTarget::new(Label::continuation(1)),
            },
            Operation::Label {
                label: Label::continuation(1),
            },
        ],
    };
    for triple in triples() {
        let isa = lookup(triple).unwrap();
        assert!(isa.compile_function(&env, &ir).is_err());
    }
}
