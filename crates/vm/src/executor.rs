use crate::bridge::{check_values, ConversionError};
use crate::config::Config;
use crate::data;
use crate::func::FunctionInstance;
use crate::host::HostContext;
use crate::inst::{Instruction, InstructionKind, MemArg};
use crate::memory::MemoryInstance;
use crate::module::Module;
use crate::stack::{self, CallFrame, Label, Stack};
use crate::store::Store;
use crate::table;
use crate::types::{BlockType, FuncType};
use crate::value::{
    self, ExtendInto, FloatOps, IntegerDivision, LittleEndian, NativeValue, SignExtend, TruncSat,
    TruncTo, Value, F32, F64,
};

use std::cell::RefCell;
use std::convert::TryFrom;
use std::ops::*;
use std::rc::Rc;

/// A runtime failure. Ends the current invocation only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Trap {
    #[error("unreachable")]
    Unreachable,
    #[error("integer divide by zero")]
    IntegerDivideByZero,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("invalid conversion to integer")]
    InvalidConversion,
    #[error("out of bounds memory access")]
    MemoryOutOfBounds,
    #[error("indirect call type mismatch: expected {expected}, found {actual}")]
    IndirectCallTypeMismatch { expected: FuncType, actual: FuncType },
    #[error("undefined element")]
    TableOutOfBounds,
    #[error("uninitialized element")]
    UninitializedElement,
    #[error("call stack exhausted")]
    StackOverflow,
    #[error("all fuel consumed")]
    FuelExhausted,
    #[error("host function failed: {0}")]
    Host(String),
    #[error("host function returned unexpected values: {0}")]
    HostConversion(#[source] ConversionError),

    // The variants below indicate a module that bypassed validation.
    #[error("corrupted stack: {0}")]
    Stack(stack::Error),
    #[error("undefined function {0}")]
    UndefinedFunc(u32),
    #[error("undefined type {0}")]
    UndefinedType(u32),
    #[error("undefined global {0}")]
    UndefinedGlobal(u32),
    #[error("no more instruction")]
    NoMoreInstruction,
}

impl Trap {
    /// Error raised by a host function.
    pub fn host(message: impl std::fmt::Display) -> Self {
        Trap::Host(message.to_string())
    }
}

impl From<stack::Error> for Trap {
    fn from(e: stack::Error) -> Self {
        match e {
            stack::Error::Overflow => Trap::StackOverflow,
            other => Trap::Stack(other),
        }
    }
}

impl From<value::Error> for Trap {
    fn from(e: value::Error) -> Self {
        match e {
            value::Error::ZeroDivision => Trap::IntegerDivideByZero,
            value::Error::IntegerOverflow => Trap::IntegerOverflow,
            value::Error::InvalidConversionToInt => Trap::InvalidConversion,
        }
    }
}

impl From<table::Error> for Trap {
    fn from(e: table::Error) -> Self {
        match e {
            table::Error::AccessOutOfBounds { .. } => Trap::TableOutOfBounds,
            table::Error::UninitializedElement(_) => Trap::UninitializedElement,
        }
    }
}

impl From<data::Error> for Trap {
    fn from(_: data::Error) -> Self {
        Trap::MemoryOutOfBounds
    }
}

impl From<crate::memory::Error> for Trap {
    fn from(_: crate::memory::Error) -> Self {
        Trap::MemoryOutOfBounds
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("unknown export {0:?}")]
    UnknownExport(String),
    #[error("export {0:?} is not a function")]
    NotAFunction(String),
    #[error("unknown function {0}")]
    UnknownFunction(u32),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    Trap(#[from] Trap),
}

pub enum Signal {
    Next,
    End,
}

pub type ExecResult<T> = std::result::Result<T, Trap>;

/// Runs `func_index` to completion. Arguments must already match its signature.
pub(crate) fn invoke(
    module: &Module,
    store: &Store,
    config: &Config,
    fuel: &mut Option<u64>,
    func_index: u32,
    args: Vec<Value>,
) -> ExecResult<Vec<Value>> {
    log::trace!("invoke function {} with {} arguments", func_index, args.len());
    let mut executor = Executor {
        module,
        store,
        fuel,
        stack: Stack::new(config.max_call_depth),
        body: 0,
        pc: 0,
    };
    executor.stack.push_values(args);
    if let Signal::Next = executor.invoke(func_index)? {
        loop {
            match executor.execute_step()? {
                Signal::Next => continue,
                Signal::End => break,
            }
        }
    }
    Ok(executor.stack.into_values())
}

pub(crate) struct Executor<'a> {
    module: &'a Module,
    store: &'a Store,
    fuel: &'a mut Option<u64>,
    stack: Stack,
    /// Code section index of the running function
    body: usize,
    pc: usize,
}

impl<'a> Executor<'a> {
    fn execute_step(&mut self) -> ExecResult<Signal> {
        let module = self.module;
        let inst = module
            .bodies()
            .get(self.body)
            .and_then(|body| body.instructions.get(self.pc))
            .ok_or(Trap::NoMoreInstruction)?;
        self.pc += 1;
        self.execute_inst(inst)
    }

    fn consume_fuel(&mut self) -> ExecResult<()> {
        if let Some(fuel) = self.fuel.as_mut() {
            if *fuel == 0 {
                return Err(Trap::FuelExhausted);
            }
            *fuel -= 1;
        }
        Ok(())
    }

    fn execute_inst(&mut self, inst: &Instruction) -> ExecResult<Signal> {
        match &inst.kind {
            InstructionKind::Unreachable => Err(Trap::Unreachable),
            InstructionKind::Nop => Ok(Signal::Next),
            InstructionKind::Block { ty, end } => {
                let (params, results) = self.block_arity(ty)?;
                self.stack.push_label(
                    Label {
                        arity: results,
                        continuation: end + 1,
                    },
                    params,
                )?;
                Ok(Signal::Next)
            }
            InstructionKind::Loop { ty } => {
                self.consume_fuel()?;
                let (params, _) = self.block_arity(ty)?;
                self.stack.push_label(
                    Label {
                        arity: params,
                        continuation: self.pc - 1,
                    },
                    params,
                )?;
                Ok(Signal::Next)
            }
            InstructionKind::If { ty, else_, end } => {
                let cond: i32 = self.pop_as()?;
                let (params, results) = self.block_arity(ty)?;
                self.stack.push_label(
                    Label {
                        arity: results,
                        continuation: end + 1,
                    },
                    params,
                )?;
                if cond == 0 {
                    // Without an else arm, `end` pops the label
                    self.pc = match else_ {
                        Some(else_) => else_ + 1,
                        None => *end,
                    };
                }
                Ok(Signal::Next)
            }
            InstructionKind::Else => self.branch(0),
            InstructionKind::End => {
                if self.stack.label_depth()? > 0 {
                    self.stack.pop_label()?;
                    Ok(Signal::Next)
                } else {
                    self.do_return()
                }
            }
            InstructionKind::Br { relative_depth } => self.branch(*relative_depth),
            InstructionKind::BrIf { relative_depth } => {
                let cond: i32 = self.pop_as()?;
                if cond != 0 {
                    self.branch(*relative_depth)
                } else {
                    Ok(Signal::Next)
                }
            }
            InstructionKind::BrTable { table: payload } => {
                let val: u32 = self.pop_as()?;
                let depth = payload
                    .table
                    .get(val as usize)
                    .copied()
                    .unwrap_or(payload.default);
                self.branch(depth)
            }
            InstructionKind::Return => self.do_return(),
            InstructionKind::Call { function_index } => self.invoke(*function_index),
            InstructionKind::CallIndirect { index, table_index } => {
                let module = self.module;
                let expected = module
                    .types()
                    .get(*index as usize)
                    .ok_or(Trap::UndefinedType(*index))?;
                let elem: u32 = self.pop_as()?;
                let table = self
                    .store
                    .table(*table_index)
                    .ok_or(Trap::TableOutOfBounds)?;
                let func_index = table.borrow().get_at(elem as usize)?;
                let func = self
                    .store
                    .func(func_index)
                    .ok_or(Trap::UndefinedFunc(func_index))?;
                if func.ty() != expected {
                    return Err(Trap::IndirectCallTypeMismatch {
                        expected: expected.clone(),
                        actual: func.ty().clone(),
                    });
                }
                self.invoke(func_index)
            }
            InstructionKind::Drop => {
                self.stack.pop_value()?;
                Ok(Signal::Next)
            }
            InstructionKind::Select | InstructionKind::TypedSelect { .. } => {
                let cond: i32 = self.pop_as()?;
                let val2 = self.stack.pop_value()?;
                let val1 = self.stack.pop_value()?;
                if cond != 0 {
                    self.stack.push_value(val1);
                } else {
                    self.stack.push_value(val2);
                }
                Ok(Signal::Next)
            }
            InstructionKind::LocalGet { local_index } => {
                let value = self.stack.local(*local_index as usize)?;
                self.stack.push_value(value);
                Ok(Signal::Next)
            }
            InstructionKind::LocalSet { local_index } => self.set_local(*local_index as usize),
            InstructionKind::LocalTee { local_index } => {
                let val = self.stack.pop_value()?;
                self.stack.push_value(val);
                self.stack.push_value(val);
                self.set_local(*local_index as usize)
            }
            InstructionKind::GlobalGet { global_index } => {
                let global = self.global(*global_index)?;
                let value = global.borrow().value();
                self.stack.push_value(value);
                Ok(Signal::Next)
            }
            InstructionKind::GlobalSet { global_index } => {
                let value = self.stack.pop_value()?;
                let global = self.global(*global_index)?;
                global.borrow_mut().set_value_unchecked(value);
                Ok(Signal::Next)
            }

            InstructionKind::I32Load { memarg } => self.load::<i32>(memarg),
            InstructionKind::I64Load { memarg } => self.load::<i64>(memarg),
            InstructionKind::F32Load { memarg } => self.load::<F32>(memarg),
            InstructionKind::F64Load { memarg } => self.load::<F64>(memarg),

            InstructionKind::I32Load8S { memarg } => self.load_extend::<i8, i32>(memarg),
            InstructionKind::I32Load8U { memarg } => self.load_extend::<u8, i32>(memarg),
            InstructionKind::I32Load16S { memarg } => self.load_extend::<i16, i32>(memarg),
            InstructionKind::I32Load16U { memarg } => self.load_extend::<u16, i32>(memarg),

            InstructionKind::I64Load8S { memarg } => self.load_extend::<i8, i64>(memarg),
            InstructionKind::I64Load8U { memarg } => self.load_extend::<u8, i64>(memarg),
            InstructionKind::I64Load16S { memarg } => self.load_extend::<i16, i64>(memarg),
            InstructionKind::I64Load16U { memarg } => self.load_extend::<u16, i64>(memarg),
            InstructionKind::I64Load32S { memarg } => self.load_extend::<i32, i64>(memarg),
            InstructionKind::I64Load32U { memarg } => self.load_extend::<u32, i64>(memarg),

            InstructionKind::I32Store { memarg } => self.store::<i32>(memarg, 4),
            InstructionKind::I64Store { memarg } => self.store::<i64>(memarg, 8),
            InstructionKind::F32Store { memarg } => self.store::<F32>(memarg, 4),
            InstructionKind::F64Store { memarg } => self.store::<F64>(memarg, 8),

            InstructionKind::I32Store8 { memarg } => self.store::<i32>(memarg, 1),
            InstructionKind::I32Store16 { memarg } => self.store::<i32>(memarg, 2),
            InstructionKind::I64Store8 { memarg } => self.store::<i64>(memarg, 1),
            InstructionKind::I64Store16 { memarg } => self.store::<i64>(memarg, 2),
            InstructionKind::I64Store32 { memarg } => self.store::<i64>(memarg, 4),

            InstructionKind::MemorySize => {
                let pages = self.memory()?.borrow().page_count();
                self.stack.push_value(Value::I32(pages as i32));
                Ok(Signal::Next)
            }
            InstructionKind::MemoryGrow => {
                let delta: u32 = self.pop_as()?;
                let result = match self.memory()?.borrow_mut().grow(delta) {
                    Ok(old) => old as i32,
                    Err(_) => -1,
                };
                self.stack.push_value(Value::I32(result));
                Ok(Signal::Next)
            }
            InstructionKind::MemoryInit { segment } => {
                let len: u32 = self.pop_as()?;
                let src: u32 = self.pop_as()?;
                let dst: u32 = self.pop_as()?;
                let data = self
                    .store
                    .data(*segment)
                    .ok_or(Trap::MemoryOutOfBounds)?
                    .borrow();
                let (src, len) = (src as usize, len as usize);
                data.validate_region(src, len)?;
                self.memory()?
                    .borrow_mut()
                    .store(dst as usize, &data.raw()[src..src + len])?;
                Ok(Signal::Next)
            }
            InstructionKind::DataDrop { segment } => {
                if let Some(data) = self.store.data(*segment) {
                    data.borrow_mut().drop_bytes();
                }
                Ok(Signal::Next)
            }
            InstructionKind::MemoryCopy => {
                let len: u32 = self.pop_as()?;
                let src: u32 = self.pop_as()?;
                let dst: u32 = self.pop_as()?;
                self.memory()?
                    .borrow_mut()
                    .copy_within(src as usize, dst as usize, len as usize)?;
                Ok(Signal::Next)
            }
            InstructionKind::MemoryFill => {
                let len: u32 = self.pop_as()?;
                let val: u32 = self.pop_as()?;
                let dst: u32 = self.pop_as()?;
                self.memory()?
                    .borrow_mut()
                    .fill(dst as usize, val as u8, len as usize)?;
                Ok(Signal::Next)
            }

            InstructionKind::I32Const { value } => {
                self.stack.push_value(Value::I32(*value));
                Ok(Signal::Next)
            }
            InstructionKind::I64Const { value } => {
                self.stack.push_value(Value::I64(*value));
                Ok(Signal::Next)
            }
            InstructionKind::F32Const { value } => {
                self.stack.push_value(Value::F32(*value));
                Ok(Signal::Next)
            }
            InstructionKind::F64Const { value } => {
                self.stack.push_value(Value::F64(*value));
                Ok(Signal::Next)
            }

            InstructionKind::I32Eqz => self.testop::<i32, _>(|v| v == 0),
            InstructionKind::I32Eq => self.relop(|a: i32, b: i32| a == b),
            InstructionKind::I32Ne => self.relop(|a: i32, b: i32| a != b),
            InstructionKind::I32LtS => self.relop(|a: i32, b: i32| a < b),
            InstructionKind::I32LtU => self.relop::<u32, _>(|a, b| a < b),
            InstructionKind::I32GtS => self.relop(|a: i32, b: i32| a > b),
            InstructionKind::I32GtU => self.relop::<u32, _>(|a, b| a > b),
            InstructionKind::I32LeS => self.relop(|a: i32, b: i32| a <= b),
            InstructionKind::I32LeU => self.relop::<u32, _>(|a, b| a <= b),
            InstructionKind::I32GeS => self.relop(|a: i32, b: i32| a >= b),
            InstructionKind::I32GeU => self.relop::<u32, _>(|a, b| a >= b),

            InstructionKind::I64Eqz => self.testop::<i64, _>(|v| v == 0),
            InstructionKind::I64Eq => self.relop(|a: i64, b: i64| a == b),
            InstructionKind::I64Ne => self.relop(|a: i64, b: i64| a != b),
            InstructionKind::I64LtS => self.relop(|a: i64, b: i64| a < b),
            InstructionKind::I64LtU => self.relop::<u64, _>(|a, b| a < b),
            InstructionKind::I64GtS => self.relop(|a: i64, b: i64| a > b),
            InstructionKind::I64GtU => self.relop::<u64, _>(|a, b| a > b),
            InstructionKind::I64LeS => self.relop(|a: i64, b: i64| a <= b),
            InstructionKind::I64LeU => self.relop::<u64, _>(|a, b| a <= b),
            InstructionKind::I64GeS => self.relop(|a: i64, b: i64| a >= b),
            InstructionKind::I64GeU => self.relop::<u64, _>(|a, b| a >= b),

            InstructionKind::F32Eq => self.relop::<f32, _>(|a, b| a == b),
            InstructionKind::F32Ne => self.relop::<f32, _>(|a, b| a != b),
            InstructionKind::F32Lt => self.relop::<f32, _>(|a, b| a < b),
            InstructionKind::F32Gt => self.relop::<f32, _>(|a, b| a > b),
            InstructionKind::F32Le => self.relop::<f32, _>(|a, b| a <= b),
            InstructionKind::F32Ge => self.relop::<f32, _>(|a, b| a >= b),

            InstructionKind::F64Eq => self.relop(|a: f64, b: f64| a == b),
            InstructionKind::F64Ne => self.relop(|a: f64, b: f64| a != b),
            InstructionKind::F64Lt => self.relop(|a: f64, b: f64| a < b),
            InstructionKind::F64Gt => self.relop(|a: f64, b: f64| a > b),
            InstructionKind::F64Le => self.relop(|a: f64, b: f64| a <= b),
            InstructionKind::F64Ge => self.relop(|a: f64, b: f64| a >= b),

            InstructionKind::I32Clz => self.unop(|v: i32| v.leading_zeros() as i32),
            InstructionKind::I32Ctz => self.unop(|v: i32| v.trailing_zeros() as i32),
            InstructionKind::I32Popcnt => self.unop(|v: i32| v.count_ones() as i32),
            InstructionKind::I32Add => self.binop(|a: i32, b: i32| a.wrapping_add(b)),
            InstructionKind::I32Sub => self.binop(|a: i32, b: i32| a.wrapping_sub(b)),
            InstructionKind::I32Mul => self.binop(|a: i32, b: i32| a.wrapping_mul(b)),
            InstructionKind::I32DivS => self.try_binop(|a: i32, b: i32| a.checked_div_op(b)),
            InstructionKind::I32DivU => self.try_binop(|a: u32, b: u32| a.checked_div_op(b)),
            InstructionKind::I32RemS => self.try_binop(|a: i32, b: i32| a.checked_rem_op(b)),
            InstructionKind::I32RemU => self.try_binop(|a: u32, b: u32| a.checked_rem_op(b)),
            InstructionKind::I32And => self.binop(|a: i32, b: i32| a.bitand(b)),
            InstructionKind::I32Or => self.binop(|a: i32, b: i32| a.bitor(b)),
            InstructionKind::I32Xor => self.binop(|a: i32, b: i32| a.bitxor(b)),
            InstructionKind::I32Shl => self.binop(|a: u32, b: u32| a.wrapping_shl(b)),
            InstructionKind::I32ShrS => self.binop(|a: i32, b: i32| a.wrapping_shr(b as u32)),
            InstructionKind::I32ShrU => self.binop(|a: u32, b: u32| a.wrapping_shr(b)),
            InstructionKind::I32Rotl => self.binop(|a: i32, b: i32| a.rotate_left(b as u32)),
            InstructionKind::I32Rotr => self.binop(|a: i32, b: i32| a.rotate_right(b as u32)),

            InstructionKind::I64Clz => self.unop(|v: i64| v.leading_zeros() as i64),
            InstructionKind::I64Ctz => self.unop(|v: i64| v.trailing_zeros() as i64),
            InstructionKind::I64Popcnt => self.unop(|v: i64| v.count_ones() as i64),
            InstructionKind::I64Add => self.binop(|a: i64, b: i64| a.wrapping_add(b)),
            InstructionKind::I64Sub => self.binop(|a: i64, b: i64| a.wrapping_sub(b)),
            InstructionKind::I64Mul => self.binop(|a: i64, b: i64| a.wrapping_mul(b)),
            InstructionKind::I64DivS => self.try_binop(|a: i64, b: i64| a.checked_div_op(b)),
            InstructionKind::I64DivU => self.try_binop(|a: u64, b: u64| a.checked_div_op(b)),
            InstructionKind::I64RemS => self.try_binop(|a: i64, b: i64| a.checked_rem_op(b)),
            InstructionKind::I64RemU => self.try_binop(|a: u64, b: u64| a.checked_rem_op(b)),
            InstructionKind::I64And => self.binop(|a: i64, b: i64| a.bitand(b)),
            InstructionKind::I64Or => self.binop(|a: i64, b: i64| a.bitor(b)),
            InstructionKind::I64Xor => self.binop(|a: i64, b: i64| a.bitxor(b)),
            InstructionKind::I64Shl => self.binop(|a: u64, b: u64| a.wrapping_shl(b as u32)),
            InstructionKind::I64ShrS => self.binop(|a: i64, b: i64| a.wrapping_shr(b as u32)),
            InstructionKind::I64ShrU => self.binop(|a: u64, b: u64| a.wrapping_shr(b as u32)),
            InstructionKind::I64Rotl => self.binop(|a: i64, b: i64| a.rotate_left(b as u32)),
            InstructionKind::I64Rotr => self.binop(|a: i64, b: i64| a.rotate_right(b as u32)),

            InstructionKind::F32Abs => self.unop(|v: f32| v.abs()),
            InstructionKind::F32Neg => self.unop(|v: f32| -v),
            InstructionKind::F32Ceil => self.unop(|v: f32| v.ceil()),
            InstructionKind::F32Floor => self.unop(|v: f32| v.floor()),
            InstructionKind::F32Trunc => self.unop(|v: f32| v.trunc()),
            InstructionKind::F32Nearest => self.unop(|v: F32| v.nearest()),
            InstructionKind::F32Sqrt => self.unop(|v: f32| v.sqrt()),
            InstructionKind::F32Add => self.binop(|a: f32, b: f32| a + b),
            InstructionKind::F32Sub => self.binop(|a: f32, b: f32| a - b),
            InstructionKind::F32Mul => self.binop(|a: f32, b: f32| a * b),
            InstructionKind::F32Div => self.binop(|a: f32, b: f32| a / b),
            InstructionKind::F32Min => self.binop(|a: F32, b: F32| a.wasm_min(b)),
            InstructionKind::F32Max => self.binop(|a: F32, b: F32| a.wasm_max(b)),
            InstructionKind::F32Copysign => self.binop(|a: F32, b: F32| a.copysign(b)),

            InstructionKind::F64Abs => self.unop(|v: f64| v.abs()),
            InstructionKind::F64Neg => self.unop(|v: f64| -v),
            InstructionKind::F64Ceil => self.unop(|v: f64| v.ceil()),
            InstructionKind::F64Floor => self.unop(|v: f64| v.floor()),
            InstructionKind::F64Trunc => self.unop(|v: f64| v.trunc()),
            InstructionKind::F64Nearest => self.unop(|v: F64| v.nearest()),
            InstructionKind::F64Sqrt => self.unop(|v: f64| v.sqrt()),
            InstructionKind::F64Add => self.binop(|a: f64, b: f64| a + b),
            InstructionKind::F64Sub => self.binop(|a: f64, b: f64| a - b),
            InstructionKind::F64Mul => self.binop(|a: f64, b: f64| a * b),
            InstructionKind::F64Div => self.binop(|a: f64, b: f64| a / b),
            InstructionKind::F64Min => self.binop(|a: F64, b: F64| a.wasm_min(b)),
            InstructionKind::F64Max => self.binop(|a: F64, b: F64| a.wasm_max(b)),
            InstructionKind::F64Copysign => self.binop(|a: F64, b: F64| a.copysign(b)),

            InstructionKind::I32WrapI64 => self.unop(|v: i64| v as i32),
            InstructionKind::I32TruncF32S => self.try_unop(|v: F32| TruncTo::<i32>::trunc_to(v)),
            InstructionKind::I32TruncF32U => self.try_unop(|v: F32| TruncTo::<u32>::trunc_to(v)),
            InstructionKind::I32TruncF64S => self.try_unop(|v: F64| TruncTo::<i32>::trunc_to(v)),
            InstructionKind::I32TruncF64U => self.try_unop(|v: F64| TruncTo::<u32>::trunc_to(v)),
            InstructionKind::I64ExtendI32S => self.unop(|v: i32| v as i64),
            InstructionKind::I64ExtendI32U => self.unop(|v: u32| v as i64),
            InstructionKind::I64TruncF32S => self.try_unop(|x: F32| TruncTo::<i64>::trunc_to(x)),
            InstructionKind::I64TruncF32U => self.try_unop(|x: F32| TruncTo::<u64>::trunc_to(x)),
            InstructionKind::I64TruncF64S => self.try_unop(|x: F64| TruncTo::<i64>::trunc_to(x)),
            InstructionKind::I64TruncF64U => self.try_unop(|x: F64| TruncTo::<u64>::trunc_to(x)),
            InstructionKind::F32ConvertI32S => self.unop(|x: i32| x as f32),
            InstructionKind::F32ConvertI32U => self.unop(|x: u32| x as f32),
            InstructionKind::F32ConvertI64S => self.unop(|x: i64| x as f32),
            InstructionKind::F32ConvertI64U => self.unop(|x: u64| x as f32),
            InstructionKind::F32DemoteF64 => self.unop(|x: f64| x as f32),
            InstructionKind::F64ConvertI32S => self.unop(|x: i32| f64::from(x)),
            InstructionKind::F64ConvertI32U => self.unop(|x: u32| f64::from(x)),
            InstructionKind::F64ConvertI64S => self.unop(|x: i64| x as f64),
            InstructionKind::F64ConvertI64U => self.unop(|x: u64| x as f64),
            InstructionKind::F64PromoteF32 => self.unop(|x: f32| f64::from(x)),

            InstructionKind::I32Extend8S => self.unop(|x: i32| x.sign_extend(8)),
            InstructionKind::I32Extend16S => self.unop(|x: i32| x.sign_extend(16)),
            InstructionKind::I64Extend8S => self.unop(|x: i64| x.sign_extend(8)),
            InstructionKind::I64Extend16S => self.unop(|x: i64| x.sign_extend(16)),
            InstructionKind::I64Extend32S => self.unop(|x: i64| x.sign_extend(32)),

            InstructionKind::I32ReinterpretF32 => self.unop(|v: F32| v.to_bits() as i32),
            InstructionKind::I64ReinterpretF64 => self.unop(|v: F64| v.to_bits() as i64),
            InstructionKind::F32ReinterpretI32 => self.unop(|v: u32| F32::from_bits(v)),
            InstructionKind::F64ReinterpretI64 => self.unop(|v: u64| F64::from_bits(v)),

            InstructionKind::I32TruncSatF32S => self.unop(|v: F32| TruncSat::<i32>::trunc_sat(v)),
            InstructionKind::I32TruncSatF32U => self.unop(|v: F32| TruncSat::<u32>::trunc_sat(v)),
            InstructionKind::I32TruncSatF64S => self.unop(|v: F64| TruncSat::<i32>::trunc_sat(v)),
            InstructionKind::I32TruncSatF64U => self.unop(|v: F64| TruncSat::<u32>::trunc_sat(v)),
            InstructionKind::I64TruncSatF32S => self.unop(|v: F32| TruncSat::<i64>::trunc_sat(v)),
            InstructionKind::I64TruncSatF32U => self.unop(|v: F32| TruncSat::<u64>::trunc_sat(v)),
            InstructionKind::I64TruncSatF64S => self.unop(|v: F64| TruncSat::<i64>::trunc_sat(v)),
            InstructionKind::I64TruncSatF64U => self.unop(|v: F64| TruncSat::<u64>::trunc_sat(v)),
        }
    }

    fn pop_as<T: NativeValue>(&mut self) -> ExecResult<T> {
        let value = self.stack.pop_value()?;
        T::from_value(value).ok_or(Trap::Stack(stack::Error::PopEmptyStack))
    }

    fn branch(&mut self, depth: u32) -> ExecResult<Signal> {
        // The outermost label belongs to the function body itself
        if depth as usize == self.stack.label_depth()? {
            return self.do_return();
        }
        let label = self.stack.unwind_to_label(depth as usize)?;
        self.pc = label.continuation;
        Ok(Signal::Next)
    }

    fn testop<T: NativeValue, F: Fn(T) -> bool>(&mut self, f: F) -> ExecResult<Signal> {
        self.unop(|a| Value::I32(if f(a) { 1 } else { 0 }))
    }

    fn relop<T: NativeValue, F: Fn(T, T) -> bool>(&mut self, f: F) -> ExecResult<Signal> {
        self.binop(|a: T, b: T| Value::I32(if f(a, b) { 1 } else { 0 }))
    }

    fn try_binop<T: NativeValue, To: Into<Value>, F: Fn(T, T) -> Result<To, value::Error>>(
        &mut self,
        f: F,
    ) -> ExecResult<Signal> {
        let rhs = self.pop_as()?;
        let lhs = self.pop_as()?;
        self.stack.push_value(f(lhs, rhs)?.into());
        Ok(Signal::Next)
    }

    fn binop<T: NativeValue, To: Into<Value>, F: Fn(T, T) -> To>(
        &mut self,
        f: F,
    ) -> ExecResult<Signal> {
        let rhs = self.pop_as()?;
        let lhs = self.pop_as()?;
        self.stack.push_value(f(lhs, rhs).into());
        Ok(Signal::Next)
    }

    /// Float-to-int truncation: every failure is an invalid conversion.
    fn try_unop<From: NativeValue, To: Into<Value>, F: Fn(From) -> Result<To, value::Error>>(
        &mut self,
        f: F,
    ) -> ExecResult<Signal> {
        let v: From = self.pop_as()?;
        let result = f(v).map_err(|_| Trap::InvalidConversion)?;
        self.stack.push_value(result.into());
        Ok(Signal::Next)
    }

    fn unop<From: NativeValue, To: Into<Value>, F: Fn(From) -> To>(
        &mut self,
        f: F,
    ) -> ExecResult<Signal> {
        let v: From = self.pop_as()?;
        self.stack.push_value(f(v).into());
        Ok(Signal::Next)
    }

    fn invoke(&mut self, func_index: u32) -> ExecResult<Signal> {
        self.consume_fuel()?;
        let store = self.store;
        let func = store
            .func(func_index)
            .ok_or(Trap::UndefinedFunc(func_index))?;
        match func {
            FunctionInstance::Defined(defined) => {
                log::trace!(
                    "call function {} ({}) at depth {}",
                    func_index,
                    func.name(),
                    self.stack.frame_count()
                );
                let args = self.stack.pop_values(defined.ty().params().len())?;
                let mut locals = defined.default_locals().to_vec();
                locals[..args.len()].copy_from_slice(&args);
                let ret_pc = if self.stack.is_over_top_level() {
                    None
                } else {
                    Some((self.body, self.pc))
                };
                let frame = CallFrame::new(
                    func_index,
                    defined.body_index(),
                    locals,
                    defined.ty().results().len(),
                    ret_pc,
                );
                self.stack.push_frame(frame)?;
                self.body = defined.body_index();
                self.pc = 0;
                Ok(Signal::Next)
            }
            FunctionInstance::Host(host) => {
                let ty = host.code().ty();
                let args = self.stack.pop_values(ty.params().len())?;
                let mut results = Vec::with_capacity(ty.results().len());
                let ctx = HostContext::new(store.memory(0).cloned());
                log::trace!("call host function {}.{}", host.module_name(), host.field_name());
                host.code().call(&args, &mut results, &ctx)?;
                check_values(&results, ty.results()).map_err(Trap::HostConversion)?;
                self.stack.push_values(results);
                if self.stack.is_over_top_level() {
                    Ok(Signal::End)
                } else {
                    Ok(Signal::Next)
                }
            }
        }
    }

    fn do_return(&mut self) -> ExecResult<Signal> {
        let frame = self.stack.pop_frame()?;
        match frame.ret_pc {
            Some((body, pc)) => {
                self.body = body;
                self.pc = pc;
                Ok(Signal::Next)
            }
            None => Ok(Signal::End),
        }
    }

    /// Returns a pair of arities for parameter and result
    fn block_arity(&self, ty: &BlockType) -> ExecResult<(usize, usize)> {
        Ok(match ty {
            BlockType::Empty => (0, 0),
            BlockType::Value(_) => (0, 1),
            BlockType::Func(type_index) => {
                let ty = self
                    .module
                    .types()
                    .get(*type_index as usize)
                    .ok_or(Trap::UndefinedType(*type_index))?;
                (ty.params().len(), ty.results().len())
            }
        })
    }

    fn set_local(&mut self, index: usize) -> ExecResult<Signal> {
        let value = self.stack.pop_value()?;
        self.stack.set_local(index, value)?;
        Ok(Signal::Next)
    }

    fn global(&self, index: u32) -> ExecResult<&'a Rc<RefCell<crate::global::GlobalInstance>>> {
        let store = self.store;
        store
            .global(index)
            .ok_or(Trap::UndefinedGlobal(index))
    }

    fn memory(&self) -> ExecResult<&'a Rc<RefCell<MemoryInstance>>> {
        let store = self.store;
        store.memory(0).ok_or(Trap::MemoryOutOfBounds)
    }

    /// `base + offset` computed without wrapping.
    fn effective_addr(base: u32, memarg: &MemArg) -> ExecResult<usize> {
        let addr = base as u64 + memarg.offset as u64;
        usize::try_from(addr).map_err(|_| Trap::MemoryOutOfBounds)
    }

    fn store<T: NativeValue + LittleEndian>(
        &mut self,
        memarg: &MemArg,
        width: usize,
    ) -> ExecResult<Signal> {
        let val: T = self.pop_as()?;
        let base: u32 = self.pop_as()?;
        let addr = Self::effective_addr(base, memarg)?;
        let mut buf = [0u8; 8];
        val.write_le(&mut buf);
        self.memory()?.borrow_mut().store(addr, &buf[..width])?;
        Ok(Signal::Next)
    }

    fn load<T: NativeValue + LittleEndian>(&mut self, memarg: &MemArg) -> ExecResult<Signal> {
        let base: u32 = self.pop_as()?;
        let addr = Self::effective_addr(base, memarg)?;
        let result: T = self.memory()?.borrow().load_as(addr)?;
        self.stack.push_value(result.into());
        Ok(Signal::Next)
    }

    fn load_extend<T: LittleEndian + ExtendInto<U>, U: Into<Value>>(
        &mut self,
        memarg: &MemArg,
    ) -> ExecResult<Signal> {
        let base: u32 = self.pop_as()?;
        let addr = Self::effective_addr(base, memarg)?;
        let result: T = self.memory()?.borrow().load_as(addr)?;
        self.stack.push_value(result.extend_into().into());
        Ok(Signal::Next)
    }
}
