//! Static checks run before a module may be instantiated.
//! Spec: https://webassembly.github.io/spec/core/valid/index.html
//!
//! Function bodies are checked with the operand/control stack algorithm from
//! the WebAssembly validation appendix: every instruction pops its operand types and
//! pushes its result types, with `None` standing for the unknown type of
//! unreachable code.

use crate::inst::{Instruction, InstructionKind, MemArg};
use crate::module::{ConstExpr, DataMode, ElementMode, FunctionBody, ImportDesc, Module, ModuleInner};
use crate::types::{BlockType, ExternKind, FuncType, GlobalType, Limits, ValType, MAX_MEMORY_PAGES};

use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSpace {
    Type,
    Function,
    Table,
    Memory,
    Global,
    Local,
    Label,
    Data,
}

impl fmt::Display for IndexSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Type => "type",
            Self::Function => "function",
            Self::Table => "table",
            Self::Memory => "memory",
            Self::Global => "global",
            Self::Local => "local",
            Self::Label => "label",
            Self::Data => "data segment",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("type mismatch in function {function} at offset {offset}")]
    TypeMismatch { function: u32, offset: usize },
    #[error("unknown {space} {index}")]
    InvalidIndex { space: IndexSpace, index: u32 },
    #[error("signature mismatch in {item}: expected {expected}, found {actual}")]
    SignatureMismatch {
        item: String,
        expected: String,
        actual: String,
    },
    #[error("multiple memories")]
    MultipleMemories,
    #[error("multiple tables")]
    MultipleTables,
    #[error("invalid limits of {what}: {reason}")]
    InvalidLimits {
        what: &'static str,
        reason: &'static str,
    },
    #[error("constant expression required at offset {offset}")]
    InvalidConstExpr { offset: usize },
    #[error("duplicate export name {0:?}")]
    DuplicateExport(String),
    #[error("global is immutable (function {function}, offset {offset})")]
    ImmutableGlobal { function: u32, offset: usize },
    #[error("alignment must not be larger than natural (function {function}, offset {offset})")]
    InvalidAlignment { function: u32, offset: usize },
    #[error("data count section required (function {function}, offset {offset})")]
    DataCountRequired { function: u32, offset: usize },
}

type Result<T> = std::result::Result<T, ValidationError>;

fn invalid_index(space: IndexSpace, index: u32) -> ValidationError {
    ValidationError::InvalidIndex { space, index }
}

/// Index spaces of the module, imports first.
struct Context<'a> {
    module: &'a ModuleInner,
    funcs: &'a [u32],
    globals: Vec<GlobalType>,
    imported_globals: usize,
    tables: usize,
    memories: usize,
}

impl<'a> Context<'a> {
    fn new(module: &'a Module) -> Self {
        let globals = module.global_types();
        let imported_globals = globals.len() - module.inner().globals.len();
        Self {
            module: module.inner(),
            funcs: module.func_type_indices(),
            globals,
            imported_globals,
            tables: module.table_types().len(),
            memories: module.memory_types().len(),
        }
    }

    fn type_at(&self, index: u32) -> Result<&'a FuncType> {
        self.module
            .types
            .get(index as usize)
            .ok_or_else(|| invalid_index(IndexSpace::Type, index))
    }

    fn func_type(&self, index: u32) -> Result<&'a FuncType> {
        let type_index = *self
            .funcs
            .get(index as usize)
            .ok_or_else(|| invalid_index(IndexSpace::Function, index))?;
        self.type_at(type_index)
    }

    fn global(&self, index: u32) -> Result<GlobalType> {
        self.globals
            .get(index as usize)
            .copied()
            .ok_or_else(|| invalid_index(IndexSpace::Global, index))
    }

    fn check_func(&self, index: u32) -> Result<()> {
        self.func_type(index).map(|_| ())
    }
}

pub(crate) fn validate_module(module: &Module) -> Result<()> {
    let ctx = Context::new(module);
    let inner = module.inner();

    for import in &inner.imports {
        match &import.desc {
            ImportDesc::Func(type_index) => {
                ctx.type_at(*type_index)?;
            }
            ImportDesc::Table(ty) => check_limits(&ty.limits, "table", None)?,
            ImportDesc::Memory(ty) => check_limits(&ty.limits, "memory", Some(MAX_MEMORY_PAGES))?,
            ImportDesc::Global(_) => {}
        }
    }
    for body in &inner.code {
        ctx.type_at(body.type_index)?;
    }

    if ctx.tables > 1 {
        return Err(ValidationError::MultipleTables);
    }
    for table in &inner.tables {
        check_limits(&table.limits, "table", None)?;
    }
    if ctx.memories > 1 {
        return Err(ValidationError::MultipleMemories);
    }
    for memory in &inner.memories {
        check_limits(&memory.limits, "memory", Some(MAX_MEMORY_PAGES))?;
    }

    for (i, global) in inner.globals.iter().enumerate() {
        let index = ctx.imported_globals + i;
        let actual = const_expr_type(&ctx, &global.init)?;
        expect_type(format!("initializer of global {}", index), global.ty.content, actual)?;
    }

    let mut names = HashSet::new();
    for export in &inner.exports {
        if !names.insert(export.name.as_str()) {
            return Err(ValidationError::DuplicateExport(export.name.clone()));
        }
        let (count, space) = match export.kind {
            ExternKind::Func => (ctx.funcs.len(), IndexSpace::Function),
            ExternKind::Table => (ctx.tables, IndexSpace::Table),
            ExternKind::Memory => (ctx.memories, IndexSpace::Memory),
            ExternKind::Global => (ctx.globals.len(), IndexSpace::Global),
        };
        if export.index as usize >= count {
            return Err(invalid_index(space, export.index));
        }
    }

    if let Some(start) = inner.start {
        let ty = ctx.func_type(start)?;
        if !ty.params().is_empty() || !ty.results().is_empty() {
            return Err(ValidationError::SignatureMismatch {
                item: "start function".to_string(),
                expected: FuncType::default().to_string(),
                actual: ty.to_string(),
            });
        }
    }

    for (i, segment) in inner.elements.iter().enumerate() {
        if let ElementMode::Active {
            table_index,
            offset,
        } = &segment.mode
        {
            if *table_index as usize >= ctx.tables {
                return Err(invalid_index(IndexSpace::Table, *table_index));
            }
            let actual = const_expr_type(&ctx, offset)?;
            expect_type(format!("offset of element segment {}", i), ValType::I32, actual)?;
        }
        for func in &segment.funcs {
            ctx.check_func(*func)?;
        }
    }

    for (i, segment) in inner.data.iter().enumerate() {
        if let DataMode::Active {
            memory_index,
            offset,
        } = &segment.mode
        {
            if *memory_index as usize >= ctx.memories {
                return Err(invalid_index(IndexSpace::Memory, *memory_index));
            }
            let actual = const_expr_type(&ctx, offset)?;
            expect_type(format!("offset of data segment {}", i), ValType::I32, actual)?;
        }
    }

    let imported_funcs = ctx.funcs.len() - inner.code.len();
    for (i, body) in inner.code.iter().enumerate() {
        FuncValidator::new(&ctx, (imported_funcs + i) as u32, body)?.validate(body)?;
    }
    log::trace!("validated {} function bodies", inner.code.len());
    Ok(())
}

fn check_limits(limits: &Limits, what: &'static str, bound: Option<u32>) -> Result<()> {
    if let Some(max) = limits.max {
        if limits.min > max {
            return Err(ValidationError::InvalidLimits {
                what,
                reason: "size minimum must not be greater than maximum",
            });
        }
    }
    if let Some(bound) = bound {
        if limits.min > bound || limits.max.map_or(false, |max| max > bound) {
            return Err(ValidationError::InvalidLimits {
                what,
                reason: "memory size must be at most 65536 pages (4GiB)",
            });
        }
    }
    Ok(())
}

fn expect_type(item: String, expected: ValType, actual: ValType) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(ValidationError::SignatureMismatch {
            item,
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

/// Type produced by a constant expression: a single constant or a
/// `global.get` of an imported immutable global, followed by `end`.
fn const_expr_type(ctx: &Context<'_>, expr: &ConstExpr) -> Result<ValType> {
    let invalid = ValidationError::InvalidConstExpr {
        offset: expr.offset,
    };
    let (first, rest) = match expr.instructions.split_first() {
        Some(split) => split,
        None => return Err(invalid),
    };
    if rest.len() != 1 || rest[0].kind != InstructionKind::End {
        return Err(invalid);
    }
    match first.kind {
        InstructionKind::I32Const { .. } => Ok(ValType::I32),
        InstructionKind::I64Const { .. } => Ok(ValType::I64),
        InstructionKind::F32Const { .. } => Ok(ValType::F32),
        InstructionKind::F64Const { .. } => Ok(ValType::F64),
        InstructionKind::GlobalGet { global_index } => {
            let global = ctx.global(global_index)?;
            if global_index as usize >= ctx.imported_globals || global.mutable {
                return Err(invalid);
            }
            Ok(global.content)
        }
        _ => Err(invalid),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Func,
    Block,
    Loop,
    If,
    Else,
}

struct CtrlFrame {
    kind: FrameKind,
    start_types: Vec<ValType>,
    end_types: Vec<ValType>,
    height: usize,
    unreachable: bool,
}

impl CtrlFrame {
    /// Types a branch to this frame carries.
    fn label_types(&self) -> &[ValType] {
        if self.kind == FrameKind::Loop {
            &self.start_types
        } else {
            &self.end_types
        }
    }
}

/// `None` is the unknown type of values produced in unreachable code.
type MaybeType = Option<ValType>;

struct FuncValidator<'c, 'a> {
    ctx: &'c Context<'a>,
    function: u32,
    locals: Vec<ValType>,
    results: Vec<ValType>,
    vals: Vec<MaybeType>,
    ctrls: Vec<CtrlFrame>,
    offset: usize,
}

impl<'c, 'a> FuncValidator<'c, 'a> {
    fn new(ctx: &'c Context<'a>, function: u32, body: &FunctionBody) -> Result<Self> {
        let ty = ctx.type_at(body.type_index)?;
        let mut locals = ty.params().to_vec();
        locals.extend_from_slice(&body.locals);
        let mut validator = Self {
            ctx,
            function,
            locals,
            results: ty.results().to_vec(),
            vals: Vec::new(),
            ctrls: Vec::new(),
            offset: 0,
        };
        validator.push_ctrl(FrameKind::Func, Vec::new(), ty.results().to_vec());
        validator.vals.clear();
        Ok(validator)
    }

    fn validate(mut self, body: &FunctionBody) -> Result<()> {
        for inst in &body.instructions {
            self.offset = inst.offset;
            if self.ctrls.is_empty() {
                return Err(self.mismatch());
            }
            self.step(inst)?;
        }
        if self.ctrls.is_empty() {
            Ok(())
        } else {
            Err(self.mismatch())
        }
    }

    fn mismatch(&self) -> ValidationError {
        ValidationError::TypeMismatch {
            function: self.function,
            offset: self.offset,
        }
    }

    fn push_val(&mut self, ty: MaybeType) {
        self.vals.push(ty);
    }

    fn push_vals(&mut self, types: &[ValType]) {
        self.vals.extend(types.iter().map(|ty| Some(*ty)));
    }

    fn pop_val(&mut self) -> Result<MaybeType> {
        let frame = self.ctrls.last().ok_or_else(|| self.mismatch())?;
        if self.vals.len() == frame.height {
            if frame.unreachable {
                return Ok(None);
            }
            return Err(self.mismatch());
        }
        self.vals.pop().ok_or_else(|| self.mismatch())
    }

    fn pop_expected(&mut self, expected: ValType) -> Result<MaybeType> {
        match self.pop_val()? {
            Some(actual) if actual != expected => Err(self.mismatch()),
            _ => Ok(Some(expected)),
        }
    }

    fn pop_expecteds(&mut self, types: &[ValType]) -> Result<()> {
        for ty in types.iter().rev() {
            self.pop_expected(*ty)?;
        }
        Ok(())
    }

    fn push_ctrl(&mut self, kind: FrameKind, start_types: Vec<ValType>, end_types: Vec<ValType>) {
        let height = self.vals.len();
        self.push_vals(&start_types);
        self.ctrls.push(CtrlFrame {
            kind,
            start_types,
            end_types,
            height,
            unreachable: false,
        });
    }

    fn pop_ctrl(&mut self) -> Result<CtrlFrame> {
        let end_types = match self.ctrls.last() {
            Some(frame) => frame.end_types.clone(),
            None => return Err(self.mismatch()),
        };
        self.pop_expecteds(&end_types)?;
        let frame = self.ctrls.pop().ok_or_else(|| self.mismatch())?;
        if self.vals.len() != frame.height {
            return Err(self.mismatch());
        }
        Ok(frame)
    }

    fn label_types(&self, depth: u32) -> Result<Vec<ValType>> {
        let depth = depth as usize;
        if depth >= self.ctrls.len() {
            return Err(invalid_index(IndexSpace::Label, depth as u32));
        }
        Ok(self.ctrls[self.ctrls.len() - depth - 1].label_types().to_vec())
    }

    fn unreachable(&mut self) -> Result<()> {
        let frame = self.ctrls.last_mut().ok_or(ValidationError::TypeMismatch {
            function: self.function,
            offset: self.offset,
        })?;
        self.vals.truncate(frame.height);
        frame.unreachable = true;
        Ok(())
    }

    fn block_signature(&self, ty: BlockType) -> Result<(Vec<ValType>, Vec<ValType>)> {
        Ok(match ty {
            BlockType::Empty => (vec![], vec![]),
            BlockType::Value(ty) => (vec![], vec![ty]),
            BlockType::Func(index) => {
                let ty = self.ctx.type_at(index)?;
                (ty.params().to_vec(), ty.results().to_vec())
            }
        })
    }

    fn local(&self, index: u32) -> Result<ValType> {
        self.locals
            .get(index as usize)
            .copied()
            .ok_or_else(|| invalid_index(IndexSpace::Local, index))
    }

    fn check_memory(&self) -> Result<()> {
        if self.ctx.memories == 0 {
            return Err(invalid_index(IndexSpace::Memory, 0));
        }
        Ok(())
    }

    fn check_memarg(&self, memarg: &MemArg, natural_bytes: u32) -> Result<()> {
        self.check_memory()?;
        if 1u64 << memarg.align > natural_bytes as u64 {
            return Err(ValidationError::InvalidAlignment {
                function: self.function,
                offset: self.offset,
            });
        }
        Ok(())
    }

    fn check_data_segment(&self, segment: u32) -> Result<()> {
        match self.ctx.module.data_count {
            None => Err(ValidationError::DataCountRequired {
                function: self.function,
                offset: self.offset,
            }),
            Some(count) if segment >= count => Err(invalid_index(IndexSpace::Data, segment)),
            Some(_) => Ok(()),
        }
    }

    fn load(&mut self, memarg: &MemArg, natural_bytes: u32, ty: ValType) -> Result<()> {
        self.check_memarg(memarg, natural_bytes)?;
        self.pop_expected(ValType::I32)?;
        self.push_val(Some(ty));
        Ok(())
    }

    fn store(&mut self, memarg: &MemArg, natural_bytes: u32, ty: ValType) -> Result<()> {
        self.check_memarg(memarg, natural_bytes)?;
        self.pop_expected(ty)?;
        self.pop_expected(ValType::I32)?;
        Ok(())
    }

    fn unary(&mut self, input: ValType, output: ValType) -> Result<()> {
        self.pop_expected(input)?;
        self.push_val(Some(output));
        Ok(())
    }

    fn binary(&mut self, input: ValType, output: ValType) -> Result<()> {
        self.pop_expected(input)?;
        self.pop_expected(input)?;
        self.push_val(Some(output));
        Ok(())
    }

    fn step(&mut self, inst: &Instruction) -> Result<()> {
        use InstructionKind::*;
        use ValType::*;

        match &inst.kind {
            Unreachable => self.unreachable()?,
            Nop => {}
            Block { ty, .. } | Loop { ty } => {
                let (params, results) = self.block_signature(*ty)?;
                self.pop_expecteds(&params)?;
                let kind = if matches!(inst.kind, Loop { .. }) {
                    FrameKind::Loop
                } else {
                    FrameKind::Block
                };
                self.push_ctrl(kind, params, results);
            }
            If { ty, .. } => {
                let (params, results) = self.block_signature(*ty)?;
                self.pop_expected(I32)?;
                self.pop_expecteds(&params)?;
                self.push_ctrl(FrameKind::If, params, results);
            }
            Else => {
                let frame = self.pop_ctrl()?;
                if frame.kind != FrameKind::If {
                    return Err(self.mismatch());
                }
                self.push_ctrl(FrameKind::Else, frame.start_types, frame.end_types);
            }
            End => {
                let frame = self.pop_ctrl()?;
                if frame.kind == FrameKind::If && frame.start_types != frame.end_types {
                    return Err(self.mismatch());
                }
                self.push_vals(&frame.end_types);
            }
            Br { relative_depth } => {
                let types = self.label_types(*relative_depth)?;
                self.pop_expecteds(&types)?;
                self.unreachable()?;
            }
            BrIf { relative_depth } => {
                self.pop_expected(I32)?;
                let types = self.label_types(*relative_depth)?;
                self.pop_expecteds(&types)?;
                self.push_vals(&types);
            }
            BrTable { table } => {
                self.pop_expected(I32)?;
                let default_types = self.label_types(table.default)?;
                for depth in table.table.iter() {
                    let types = self.label_types(*depth)?;
                    if types.len() != default_types.len() {
                        return Err(self.mismatch());
                    }
                    let popped = {
                        let mut popped = Vec::with_capacity(types.len());
                        for ty in types.iter().rev() {
                            popped.push(self.pop_expected(*ty)?);
                        }
                        popped
                    };
                    for ty in popped.into_iter().rev() {
                        self.push_val(ty);
                    }
                }
                self.pop_expecteds(&default_types)?;
                self.unreachable()?;
            }
            Return => {
                let results = self.results.clone();
                self.pop_expecteds(&results)?;
                self.unreachable()?;
            }
            Call { function_index } => {
                let ty = self.ctx.func_type(*function_index)?;
                self.pop_expecteds(ty.params())?;
                self.push_vals(ty.results());
            }
            CallIndirect { index, table_index } => {
                if *table_index as usize >= self.ctx.tables {
                    return Err(invalid_index(IndexSpace::Table, *table_index));
                }
                let ty = self.ctx.type_at(*index)?;
                self.pop_expected(I32)?;
                self.pop_expecteds(ty.params())?;
                self.push_vals(ty.results());
            }
            Drop => {
                self.pop_val()?;
            }
            Select => {
                self.pop_expected(I32)?;
                let first = self.pop_val()?;
                let second = self.pop_val()?;
                match (first, second) {
                    (Some(a), Some(b)) if a != b => return Err(self.mismatch()),
                    (Some(ty), _) | (_, Some(ty)) => self.push_val(Some(ty)),
                    (None, None) => self.push_val(None),
                }
            }
            TypedSelect { ty } => {
                self.pop_expected(I32)?;
                self.pop_expected(*ty)?;
                self.pop_expected(*ty)?;
                self.push_val(Some(*ty));
            }
            LocalGet { local_index } => {
                let ty = self.local(*local_index)?;
                self.push_val(Some(ty));
            }
            LocalSet { local_index } => {
                let ty = self.local(*local_index)?;
                self.pop_expected(ty)?;
            }
            LocalTee { local_index } => {
                let ty = self.local(*local_index)?;
                self.pop_expected(ty)?;
                self.push_val(Some(ty));
            }
            GlobalGet { global_index } => {
                let global = self.ctx.global(*global_index)?;
                self.push_val(Some(global.content));
            }
            GlobalSet { global_index } => {
                let global = self.ctx.global(*global_index)?;
                if !global.mutable {
                    return Err(ValidationError::ImmutableGlobal {
                        function: self.function,
                        offset: self.offset,
                    });
                }
                self.pop_expected(global.content)?;
            }
            I32Load { memarg } => self.load(memarg, 4, I32)?,
            I64Load { memarg } => self.load(memarg, 8, I64)?,
            F32Load { memarg } => self.load(memarg, 4, F32)?,
            F64Load { memarg } => self.load(memarg, 8, F64)?,
            I32Load8S { memarg } | I32Load8U { memarg } => self.load(memarg, 1, I32)?,
            I32Load16S { memarg } | I32Load16U { memarg } => self.load(memarg, 2, I32)?,
            I64Load8S { memarg } | I64Load8U { memarg } => self.load(memarg, 1, I64)?,
            I64Load16S { memarg } | I64Load16U { memarg } => self.load(memarg, 2, I64)?,
            I64Load32S { memarg } | I64Load32U { memarg } => self.load(memarg, 4, I64)?,
            I32Store { memarg } => self.store(memarg, 4, I32)?,
            I64Store { memarg } => self.store(memarg, 8, I64)?,
            F32Store { memarg } => self.store(memarg, 4, F32)?,
            F64Store { memarg } => self.store(memarg, 8, F64)?,
            I32Store8 { memarg } => self.store(memarg, 1, I32)?,
            I32Store16 { memarg } => self.store(memarg, 2, I32)?,
            I64Store8 { memarg } => self.store(memarg, 1, I64)?,
            I64Store16 { memarg } => self.store(memarg, 2, I64)?,
            I64Store32 { memarg } => self.store(memarg, 4, I64)?,
            MemorySize => {
                self.check_memory()?;
                self.push_val(Some(I32));
            }
            MemoryGrow => {
                self.check_memory()?;
                self.unary(I32, I32)?;
            }
            MemoryInit { segment } => {
                self.check_memory()?;
                self.check_data_segment(*segment)?;
                self.pop_expecteds(&[I32, I32, I32])?;
            }
            DataDrop { segment } => self.check_data_segment(*segment)?,
            MemoryCopy | MemoryFill => {
                self.check_memory()?;
                self.pop_expecteds(&[I32, I32, I32])?;
            }
            I32Const { .. } => self.push_val(Some(I32)),
            I64Const { .. } => self.push_val(Some(I64)),
            F32Const { .. } => self.push_val(Some(F32)),
            F64Const { .. } => self.push_val(Some(F64)),

            I32Eqz => self.unary(I32, I32)?,
            I32Eq | I32Ne | I32LtS | I32LtU | I32GtS | I32GtU | I32LeS | I32LeU | I32GeS
            | I32GeU => self.binary(I32, I32)?,
            I64Eqz => self.unary(I64, I32)?,
            I64Eq | I64Ne | I64LtS | I64LtU | I64GtS | I64GtU | I64LeS | I64LeU | I64GeS
            | I64GeU => self.binary(I64, I32)?,
            F32Eq | F32Ne | F32Lt | F32Gt | F32Le | F32Ge => self.binary(F32, I32)?,
            F64Eq | F64Ne | F64Lt | F64Gt | F64Le | F64Ge => self.binary(F64, I32)?,

            I32Clz | I32Ctz | I32Popcnt | I32Extend8S | I32Extend16S => self.unary(I32, I32)?,
            I32Add | I32Sub | I32Mul | I32DivS | I32DivU | I32RemS | I32RemU | I32And | I32Or
            | I32Xor | I32Shl | I32ShrS | I32ShrU | I32Rotl | I32Rotr => self.binary(I32, I32)?,
            I64Clz | I64Ctz | I64Popcnt | I64Extend8S | I64Extend16S | I64Extend32S => {
                self.unary(I64, I64)?
            }
            I64Add | I64Sub | I64Mul | I64DivS | I64DivU | I64RemS | I64RemU | I64And | I64Or
            | I64Xor | I64Shl | I64ShrS | I64ShrU | I64Rotl | I64Rotr => self.binary(I64, I64)?,
            F32Abs | F32Neg | F32Ceil | F32Floor | F32Trunc | F32Nearest | F32Sqrt => {
                self.unary(F32, F32)?
            }
            F32Add | F32Sub | F32Mul | F32Div | F32Min | F32Max | F32Copysign => {
                self.binary(F32, F32)?
            }
            F64Abs | F64Neg | F64Ceil | F64Floor | F64Trunc | F64Nearest | F64Sqrt => {
                self.unary(F64, F64)?
            }
            F64Add | F64Sub | F64Mul | F64Div | F64Min | F64Max | F64Copysign => {
                self.binary(F64, F64)?
            }

            I32WrapI64 => self.unary(I64, I32)?,
            I32TruncF32S | I32TruncF32U | I32TruncSatF32S | I32TruncSatF32U
            | I32ReinterpretF32 => self.unary(F32, I32)?,
            I32TruncF64S | I32TruncF64U | I32TruncSatF64S | I32TruncSatF64U => {
                self.unary(F64, I32)?
            }
            I64ExtendI32S | I64ExtendI32U => self.unary(I32, I64)?,
            I64TruncF32S | I64TruncF32U | I64TruncSatF32S | I64TruncSatF32U => {
                self.unary(F32, I64)?
            }
            I64TruncF64S | I64TruncF64U | I64TruncSatF64S | I64TruncSatF64U
            | I64ReinterpretF64 => self.unary(F64, I64)?,
            F32ConvertI32S | F32ConvertI32U | F32ReinterpretI32 => self.unary(I32, F32)?,
            F32ConvertI64S | F32ConvertI64U => self.unary(I64, F32)?,
            F32DemoteF64 => self.unary(F64, F32)?,
            F64ConvertI32S | F64ConvertI32U => self.unary(I32, F64)?,
            F64ConvertI64S | F64ConvertI64U | F64ReinterpretI64 => self.unary(I64, F64)?,
            F64PromoteF32 => self.unary(F32, F64)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load;
    use crate::module::CompileError;

    fn wat(text: &str) -> Vec<u8> {
        let buf = wast::parser::ParseBuffer::new(text).unwrap();
        let mut module = wast::parser::parse::<wast::Wat>(&buf).unwrap();
        module.encode().unwrap()
    }

    fn validate_wat(text: &str) -> Result<()> {
        load(&wat(text)).unwrap().validate()
    }

    #[test]
    fn accepts_well_typed_functions() {
        validate_wat(
            r#"(module
                 (memory 1)
                 (func (param i32) (result i32)
                   (block (result i32)
                     local.get 0
                     br_if 0 (i32.const 7)
                     drop
                     i32.const 1)
                   (if (result i32) (then (i32.const 2)) (else (i32.const 3)))
                   (loop (param i32) (result i32) nop)
                   i32.load offset=4 align=4)
                 (func (result i64)
                   unreachable
                   i64.add))"#,
        )
        .unwrap();
    }

    #[test]
    fn reports_type_mismatch_with_location() {
        let bytes = wat(r#"(module (func (result i32) (i64.const 1)))"#);
        let err = load(&bytes).unwrap().validate().unwrap_err();
        match err {
            ValidationError::TypeMismatch { function, offset } => {
                assert_eq!(function, 0);
                assert!(offset > 8 && offset < bytes.len());
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn function_index_accounts_for_imports() {
        let err = validate_wat(
            r#"(module
                 (import "env" "f" (func))
                 (func (result i32) (i32.add (i32.const 1) (f32.const 2))))"#,
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::TypeMismatch { function: 1, .. }));
    }

    #[test]
    fn rejects_unknown_indices() {
        let err = validate_wat(r#"(module (func call 5))"#).unwrap_err();
        assert_eq!(
            err,
            ValidationError::InvalidIndex {
                space: IndexSpace::Function,
                index: 5
            }
        );
        let err = validate_wat(r#"(module (func (result i32) local.get 2))"#).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidIndex {
                space: IndexSpace::Local,
                ..
            }
        ));
        let err = validate_wat(r#"(module (func (drop (i32.load (i32.const 0)))))"#).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidIndex {
                space: IndexSpace::Memory,
                ..
            }
        ));
    }

    #[test]
    fn rejects_bad_start_signature() {
        let err = validate_wat(r#"(module (func $main (param i32)) (start $main))"#).unwrap_err();
        assert!(matches!(err, ValidationError::SignatureMismatch { .. }));
    }

    #[test]
    fn rejects_mistyped_global_initializer() {
        let err = validate_wat(r#"(module (global i32 (i64.const 0)))"#).unwrap_err();
        assert!(matches!(err, ValidationError::SignatureMismatch { .. }));
    }

    #[test]
    fn rejects_immutable_global_set() {
        let err = validate_wat(
            r#"(module (global $g i32 (i32.const 0)) (func (global.set $g (i32.const 1))))"#,
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::ImmutableGlobal { .. }));
    }

    #[test]
    fn rejects_overaligned_access() {
        let err = validate_wat(
            r#"(module (memory 1) (func (drop (i32.load8_u align=2 (i32.const 0)))))"#,
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidAlignment { .. }));
    }

    #[test]
    fn rejects_duplicate_exports() {
        let err = validate_wat(
            r#"(module (func (export "f")) (func (export "f")))"#,
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::DuplicateExport("f".to_string()));
    }

    #[test]
    fn rejects_oversized_memory() {
        let err = validate_wat(r#"(module (memory 65537))"#).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidLimits { .. }));
    }

    #[test]
    fn verdict_is_cached_and_deterministic() {
        let bytes = wat(r#"(module (func (result i32) (f32.const 0)))"#);
        let module = load(&bytes).unwrap();
        let first = module.validate();
        assert_eq!(first, module.validate());
        assert_eq!(first, load(&bytes).unwrap().validate());
        assert!(matches!(
            crate::module::Module::new(&bytes),
            Err(CompileError::Validation(_))
        ));
    }
}
