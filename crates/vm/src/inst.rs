use std::convert::TryFrom;
use crate::loader::{val_type, LoadError};
use crate::types::{BlockType, ValType};
use crate::value::{F32, F64};
use wasmparser::{Operator, OperatorsReader};

#[derive(Debug, Clone)]
pub struct Instruction {
    pub kind: InstructionKind,
    /// Byte offset in the module binary
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemArg {
    /// log2 of the alignment hint
    pub align: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrTableData {
    pub table: Box<[u32]>,
    pub default: u32,
}

/// Decoded instruction. Structured control instructions carry the index of
/// their matching `end` (and `else`) inside the same body.
#[derive(Debug, Clone, PartialEq)]
pub enum InstructionKind {
    Unreachable,
    Nop,
    Block { ty: BlockType, end: usize },
    Loop { ty: BlockType },
    If { ty: BlockType, else_: Option<usize>, end: usize },
    Else,
    End,
    Br { relative_depth: u32 },
    BrIf { relative_depth: u32 },
    BrTable { table: Box<BrTableData> },
    Return,
    Call { function_index: u32 },
    CallIndirect { index: u32, table_index: u32 },
    Drop,
    Select,
    TypedSelect { ty: ValType },
    LocalGet { local_index: u32 },
    LocalSet { local_index: u32 },
    LocalTee { local_index: u32 },
    GlobalGet { global_index: u32 },
    GlobalSet { global_index: u32 },
    I32Load { memarg: MemArg },
    I64Load { memarg: MemArg },
    F32Load { memarg: MemArg },
    F64Load { memarg: MemArg },
    I32Load8S { memarg: MemArg },
    I32Load8U { memarg: MemArg },
    I32Load16S { memarg: MemArg },
    I32Load16U { memarg: MemArg },
    I64Load8S { memarg: MemArg },
    I64Load8U { memarg: MemArg },
    I64Load16S { memarg: MemArg },
    I64Load16U { memarg: MemArg },
    I64Load32S { memarg: MemArg },
    I64Load32U { memarg: MemArg },
    I32Store { memarg: MemArg },
    I64Store { memarg: MemArg },
    F32Store { memarg: MemArg },
    F64Store { memarg: MemArg },
    I32Store8 { memarg: MemArg },
    I32Store16 { memarg: MemArg },
    I64Store8 { memarg: MemArg },
    I64Store16 { memarg: MemArg },
    I64Store32 { memarg: MemArg },
    MemorySize,
    MemoryGrow,
    MemoryInit { segment: u32 },
    DataDrop { segment: u32 },
    MemoryCopy,
    MemoryFill,
    I32Const { value: i32 },
    I64Const { value: i64 },
    F32Const { value: F32 },
    F64Const { value: F64 },
    I32Eqz,
    I32Eq,
    I32Ne,
    I32LtS,
    I32LtU,
    I32GtS,
    I32GtU,
    I32LeS,
    I32LeU,
    I32GeS,
    I32GeU,
    I64Eqz,
    I64Eq,
    I64Ne,
    I64LtS,
    I64LtU,
    I64GtS,
    I64GtU,
    I64LeS,
    I64LeU,
    I64GeS,
    I64GeU,
    F32Eq,
    F32Ne,
    F32Lt,
    F32Gt,
    F32Le,
    F32Ge,
    F64Eq,
    F64Ne,
    F64Lt,
    F64Gt,
    F64Le,
    F64Ge,
    I32Clz,
    I32Ctz,
    I32Popcnt,
    I32Add,
    I32Sub,
    I32Mul,
    I32DivS,
    I32DivU,
    I32RemS,
    I32RemU,
    I32And,
    I32Or,
    I32Xor,
    I32Shl,
    I32ShrS,
    I32ShrU,
    I32Rotl,
    I32Rotr,
    I64Clz,
    I64Ctz,
    I64Popcnt,
    I64Add,
    I64Sub,
    I64Mul,
    I64DivS,
    I64DivU,
    I64RemS,
    I64RemU,
    I64And,
    I64Or,
    I64Xor,
    I64Shl,
    I64ShrS,
    I64ShrU,
    I64Rotl,
    I64Rotr,
    F32Abs,
    F32Neg,
    F32Ceil,
    F32Floor,
    F32Trunc,
    F32Nearest,
    F32Sqrt,
    F32Add,
    F32Sub,
    F32Mul,
    F32Div,
    F32Min,
    F32Max,
    F32Copysign,
    F64Abs,
    F64Neg,
    F64Ceil,
    F64Floor,
    F64Trunc,
    F64Nearest,
    F64Sqrt,
    F64Add,
    F64Sub,
    F64Mul,
    F64Div,
    F64Min,
    F64Max,
    F64Copysign,
    I32WrapI64,
    I32TruncF32S,
    I32TruncF32U,
    I32TruncF64S,
    I32TruncF64U,
    I64ExtendI32S,
    I64ExtendI32U,
    I64TruncF32S,
    I64TruncF32U,
    I64TruncF64S,
    I64TruncF64U,
    F32ConvertI32S,
    F32ConvertI32U,
    F32ConvertI64S,
    F32ConvertI64U,
    F32DemoteF64,
    F64ConvertI32S,
    F64ConvertI32U,
    F64ConvertI64S,
    F64ConvertI64U,
    F64PromoteF32,
    I32ReinterpretF32,
    I64ReinterpretF64,
    F32ReinterpretI32,
    F64ReinterpretI64,
    I32Extend8S,
    I32Extend16S,
    I64Extend8S,
    I64Extend16S,
    I64Extend32S,
    I32TruncSatF32S,
    I32TruncSatF32U,
    I32TruncSatF64S,
    I32TruncSatF64U,
    I64TruncSatF32S,
    I64TruncSatF32U,
    I64TruncSatF64S,
    I64TruncSatF64U,
}

/// Reads instructions up to and including the `end` closing the expression,
/// resolving the `else`/`end` targets of every structured instruction.
pub(crate) fn read_expr(reader: &mut OperatorsReader<'_>) -> Result<Vec<Instruction>, LoadError> {
    use InstructionKind::*;

    let mut insts: Vec<Instruction> = Vec::new();
    let mut open_blocks: Vec<usize> = Vec::new();
    loop {
        let (op, offset) = reader.read_with_offset()?;
        let inst = Instruction {
            kind: transform_inst(op, offset)?,
            offset,
        };
        let index = insts.len();
        match &inst.kind {
            Block { .. } | Loop { .. } | If { .. } => open_blocks.push(index),
            Else => {
                let attached = match open_blocks.last() {
                    Some(&opener) => match &mut insts[opener].kind {
                        If { else_, .. } if else_.is_none() => {
                            *else_ = Some(index);
                            true
                        }
                        _ => false,
                    },
                    None => false,
                };
                if !attached {
                    return Err(LoadError::malformed(
                        inst.offset,
                        "else found outside of an `if` block",
                    ));
                }
            }
            End => match open_blocks.pop() {
                Some(opener) => match &mut insts[opener].kind {
                    Block { end, .. } | If { end, .. } => *end = index,
                    _ => {}
                },
                None => {
                    insts.push(inst);
                    return Ok(insts);
                }
            },
            _ => {}
        }
        insts.push(inst);
    }
}

fn block_type(ty: wasmparser::BlockType, offset: usize) -> Result<BlockType, LoadError> {
    Ok(match ty {
        wasmparser::BlockType::Empty => BlockType::Empty,
        wasmparser::BlockType::Type(ty) => BlockType::Value(val_type(ty, offset)?),
        wasmparser::BlockType::FuncType(index) => BlockType::Func(index),
    })
}

fn memarg(memarg: wasmparser::MemArg, offset: usize) -> Result<MemArg, LoadError> {
    if memarg.memory != 0 {
        return Err(LoadError::Unsupported {
            offset,
            feature: "multiple memories",
        });
    }
    if memarg.align >= 32 {
        return Err(LoadError::malformed(offset, "malformed memop flags"));
    }
    let static_offset = u32::try_from(memarg.offset)
        .map_err(|_| LoadError::malformed(offset, "offset out of range"))?;
    Ok(MemArg {
        align: memarg.align as u32,
        offset: static_offset,
    })
}

fn zero_memory(mem: u32, offset: usize) -> Result<(), LoadError> {
    if mem == 0 {
        Ok(())
    } else {
        Err(LoadError::malformed(offset, "zero byte expected"))
    }
}

/// Operators without immediates share their name with `InstructionKind`.
macro_rules! transform_plain {
    ($op:expr, $offset:expr, [$($name:ident)*]) => {
        match $op {
            $(Operator::$name => Ok(InstructionKind::$name),)*
            other => transform_with_immediates(other, $offset),
        }
    };
}

/// Converts one decoded operator. Structured instructions start with
/// placeholder targets that [`read_expr`] fills in.
fn transform_inst(op: Operator<'_>, offset: usize) -> Result<InstructionKind, LoadError> {
    transform_plain!(op, offset, [
        Unreachable Nop Else End Return Drop Select
        I32Eqz I32Eq I32Ne I32LtS I32LtU I32GtS I32GtU I32LeS I32LeU I32GeS I32GeU
        I64Eqz I64Eq I64Ne I64LtS I64LtU I64GtS I64GtU I64LeS I64LeU I64GeS I64GeU
        F32Eq F32Ne F32Lt F32Gt F32Le F32Ge
        F64Eq F64Ne F64Lt F64Gt F64Le F64Ge
        I32Clz I32Ctz I32Popcnt I32Add I32Sub I32Mul I32DivS I32DivU I32RemS I32RemU
        I32And I32Or I32Xor I32Shl I32ShrS I32ShrU I32Rotl I32Rotr
        I64Clz I64Ctz I64Popcnt I64Add I64Sub I64Mul I64DivS I64DivU I64RemS I64RemU
        I64And I64Or I64Xor I64Shl I64ShrS I64ShrU I64Rotl I64Rotr
        F32Abs F32Neg F32Ceil F32Floor F32Trunc F32Nearest F32Sqrt
        F32Add F32Sub F32Mul F32Div F32Min F32Max F32Copysign
        F64Abs F64Neg F64Ceil F64Floor F64Trunc F64Nearest F64Sqrt
        F64Add F64Sub F64Mul F64Div F64Min F64Max F64Copysign
        I32WrapI64 I32TruncF32S I32TruncF32U I32TruncF64S I32TruncF64U
        I64ExtendI32S I64ExtendI32U I64TruncF32S I64TruncF32U I64TruncF64S I64TruncF64U
        F32ConvertI32S F32ConvertI32U F32ConvertI64S F32ConvertI64U F32DemoteF64
        F64ConvertI32S F64ConvertI32U F64ConvertI64S F64ConvertI64U F64PromoteF32
        I32ReinterpretF32 I64ReinterpretF64 F32ReinterpretI32 F64ReinterpretI64
        I32Extend8S I32Extend16S I64Extend8S I64Extend16S I64Extend32S
        I32TruncSatF32S I32TruncSatF32U I32TruncSatF64S I32TruncSatF64U
        I64TruncSatF32S I64TruncSatF32U I64TruncSatF64S I64TruncSatF64U
    ])
}

fn transform_with_immediates(
    op: Operator<'_>,
    offset: usize,
) -> Result<InstructionKind, LoadError> {
    use InstructionKind::*;

    let kind = match op {
        Operator::Block { blockty } => Block {
            ty: block_type(blockty, offset)?,
            end: 0,
        },
        Operator::Loop { blockty } => Loop {
            ty: block_type(blockty, offset)?,
        },
        Operator::If { blockty } => If {
            ty: block_type(blockty, offset)?,
            else_: None,
            end: 0,
        },
        Operator::Br { relative_depth } => Br { relative_depth },
        Operator::BrIf { relative_depth } => BrIf { relative_depth },
        Operator::BrTable { targets } => BrTable {
            table: Box::new(BrTableData {
                table: targets.targets().collect::<Result<Vec<_>, _>>()?.into_boxed_slice(),
                default: targets.default(),
            }),
        },
        Operator::Call { function_index } => Call { function_index },
        Operator::CallIndirect {
            type_index,
            table_index,
            ..
        } => CallIndirect {
            index: type_index,
            table_index,
        },
        Operator::TypedSelect { ty } => TypedSelect {
            ty: val_type(ty, offset)?,
        },
        Operator::LocalGet { local_index } => LocalGet { local_index },
        Operator::LocalSet { local_index } => LocalSet { local_index },
        Operator::LocalTee { local_index } => LocalTee { local_index },
        Operator::GlobalGet { global_index } => GlobalGet { global_index },
        Operator::GlobalSet { global_index } => GlobalSet { global_index },
        Operator::I32Load { memarg: m } => I32Load { memarg: memarg(m, offset)? },
        Operator::I64Load { memarg: m } => I64Load { memarg: memarg(m, offset)? },
        Operator::F32Load { memarg: m } => F32Load { memarg: memarg(m, offset)? },
        Operator::F64Load { memarg: m } => F64Load { memarg: memarg(m, offset)? },
        Operator::I32Load8S { memarg: m } => I32Load8S { memarg: memarg(m, offset)? },
        Operator::I32Load8U { memarg: m } => I32Load8U { memarg: memarg(m, offset)? },
        Operator::I32Load16S { memarg: m } => I32Load16S { memarg: memarg(m, offset)? },
        Operator::I32Load16U { memarg: m } => I32Load16U { memarg: memarg(m, offset)? },
        Operator::I64Load8S { memarg: m } => I64Load8S { memarg: memarg(m, offset)? },
        Operator::I64Load8U { memarg: m } => I64Load8U { memarg: memarg(m, offset)? },
        Operator::I64Load16S { memarg: m } => I64Load16S { memarg: memarg(m, offset)? },
        Operator::I64Load16U { memarg: m } => I64Load16U { memarg: memarg(m, offset)? },
        Operator::I64Load32S { memarg: m } => I64Load32S { memarg: memarg(m, offset)? },
        Operator::I64Load32U { memarg: m } => I64Load32U { memarg: memarg(m, offset)? },
        Operator::I32Store { memarg: m } => I32Store { memarg: memarg(m, offset)? },
        Operator::I64Store { memarg: m } => I64Store { memarg: memarg(m, offset)? },
        Operator::F32Store { memarg: m } => F32Store { memarg: memarg(m, offset)? },
        Operator::F64Store { memarg: m } => F64Store { memarg: memarg(m, offset)? },
        Operator::I32Store8 { memarg: m } => I32Store8 { memarg: memarg(m, offset)? },
        Operator::I32Store16 { memarg: m } => I32Store16 { memarg: memarg(m, offset)? },
        Operator::I64Store8 { memarg: m } => I64Store8 { memarg: memarg(m, offset)? },
        Operator::I64Store16 { memarg: m } => I64Store16 { memarg: memarg(m, offset)? },
        Operator::I64Store32 { memarg: m } => I64Store32 { memarg: memarg(m, offset)? },
        Operator::MemorySize { mem, .. } => {
            zero_memory(mem, offset)?;
            MemorySize
        }
        Operator::MemoryGrow { mem, .. } => {
            zero_memory(mem, offset)?;
            MemoryGrow
        }
        Operator::MemoryInit { data_index, .. } => MemoryInit {
            segment: data_index,
        },
        Operator::DataDrop { data_index } => DataDrop {
            segment: data_index,
        },
        Operator::MemoryCopy { .. } => MemoryCopy,
        Operator::MemoryFill { mem } => {
            zero_memory(mem, offset)?;
            MemoryFill
        }
        Operator::I32Const { value } => I32Const { value },
        Operator::I64Const { value } => I64Const { value },
        Operator::F32Const { value } => F32Const {
            value: F32::from_bits(value.bits()),
        },
        Operator::F64Const { value } => F64Const {
            value: F64::from_bits(value.bits()),
        },
        Operator::RefNull { .. } | Operator::RefIsNull { .. } | Operator::RefFunc { .. } => {
            return Err(LoadError::Unsupported {
                offset,
                feature: "reference types",
            })
        }
        Operator::TableGet { .. }
        | Operator::TableSet { .. }
        | Operator::TableInit { .. }
        | Operator::ElemDrop { .. }
        | Operator::TableCopy { .. }
        | Operator::TableGrow { .. }
        | Operator::TableSize { .. }
        | Operator::TableFill { .. } => {
            return Err(LoadError::Unsupported {
                offset,
                feature: "table instructions",
            })
        }
        other => {
            log::trace!("rejecting {:?} at offset {}", other, offset);
            return Err(LoadError::Unsupported {
                offset,
                feature: "post-MVP instructions",
            });
        }
    };
    Ok(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load;

    /// A module with one `[] -> []` function whose expression is `body`.
    fn module_with_body(body: &[u8]) -> Vec<u8> {
        let mut code = vec![0x01, body.len() as u8 + 1, 0x00];
        code.extend_from_slice(body);
        let mut bytes = vec![0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00];
        bytes.extend_from_slice(&[0x01, 0x04, 0x01, 0x60, 0x00, 0x00]);
        bytes.extend_from_slice(&[0x03, 0x02, 0x01, 0x00]);
        bytes.push(0x0A);
        bytes.push(code.len() as u8);
        bytes.extend_from_slice(&code);
        bytes
    }

    fn decode(body: &[u8]) -> Result<Vec<Instruction>, LoadError> {
        let module = load(&module_with_body(body))?;
        Ok(module.bodies()[0].instructions.clone())
    }

    #[test]
    fn block_targets_are_resolved() {
        // block; i32.const 1; if; nop; else; nop; end; end; end
        let body = [
            0x02, 0x40, 0x41, 0x01, 0x04, 0x40, 0x01, 0x05, 0x01, 0x0B, 0x0B, 0x0B,
        ];
        let insts = decode(&body).unwrap();
        assert_eq!(insts.len(), 9);
        assert_eq!(
            insts[0].kind,
            InstructionKind::Block {
                ty: BlockType::Empty,
                end: 7
            }
        );
        assert_eq!(
            insts[2].kind,
            InstructionKind::If {
                ty: BlockType::Empty,
                else_: Some(4),
                end: 6
            }
        );
        assert_eq!(insts[8].kind, InstructionKind::End);
        assert_eq!(insts[2].offset, insts[0].offset + 4);
    }

    #[test]
    fn else_without_if_is_malformed() {
        let body = [0x02, 0x40, 0x05, 0x0B, 0x0B];
        assert!(matches!(decode(&body), Err(LoadError::Malformed { .. })));
    }

    #[test]
    fn missing_end_is_truncated() {
        let body = [0x41, 0x00, 0x1A];
        assert!(matches!(decode(&body), Err(LoadError::Truncated { .. })));
    }

    #[test]
    fn trailing_operators_are_malformed() {
        let body = [0x0B, 0x01];
        assert!(matches!(decode(&body), Err(LoadError::Malformed { .. })));
    }

    #[test]
    fn block_type_with_type_index() {
        let body = [0x02, 0x00, 0x0B, 0x0B];
        let insts = decode(&body).unwrap();
        assert_eq!(
            insts[0].kind,
            InstructionKind::Block {
                ty: BlockType::Func(0),
                end: 1
            }
        );
    }

    #[test]
    fn immediates_are_carried_over() {
        // i32.const -1; i32.load offset=8 align=2; drop; end
        let body = [0x41, 0x7F, 0x28, 0x02, 0x08, 0x1A, 0x0B];
        let insts = decode(&body).unwrap();
        assert_eq!(insts[0].kind, InstructionKind::I32Const { value: -1 });
        assert_eq!(
            insts[1].kind,
            InstructionKind::I32Load {
                memarg: MemArg { align: 2, offset: 8 }
            }
        );
    }

    #[test]
    fn memory_index_must_be_zero() {
        // memory.size 1; drop; end
        let body = [0x3F, 0x01, 0x1A, 0x0B];
        assert!(matches!(decode(&body), Err(LoadError::Malformed { .. })));
    }

    #[test]
    fn reference_instructions_are_unsupported() {
        // ref.null func; drop; end
        let body = [0xD0, 0x70, 0x1A, 0x0B];
        assert!(matches!(
            decode(&body),
            Err(LoadError::Unsupported {
                feature: "reference types",
                ..
            })
        ));
    }
}
