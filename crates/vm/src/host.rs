use super::value::Value;

use std::cell::{RefCell, RefMut};
use std::rc::Rc;

use super::executor::Trap;
use super::global::GlobalInstance;
use super::memory::MemoryInstance;
use super::table::TableInstance;
use super::types::{ExternKind, FuncType};

type Ref<T> = Rc<RefCell<T>>;

/// What a host function can see of the calling instance.
pub struct HostContext {
    memory: Option<Ref<MemoryInstance>>,
}

impl HostContext {
    pub(crate) fn new(memory: Option<Ref<MemoryInstance>>) -> Self {
        Self { memory }
    }

    /// The caller's linear memory, if it has one. The borrow must be released
    /// before calling back into WebAssembly code that shares the memory.
    pub fn memory(&self) -> Option<RefMut<'_, MemoryInstance>> {
        self.memory.as_ref().map(|mem| mem.borrow_mut())
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), Trap> {
        match self.memory() {
            Some(mem) => mem.load(offset, buf).map_err(|_| Trap::MemoryOutOfBounds),
            None => Err(Trap::MemoryOutOfBounds),
        }
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), Trap> {
        match self.memory() {
            Some(mut mem) => mem.store(offset, data).map_err(|_| Trap::MemoryOutOfBounds),
            None => Err(Trap::MemoryOutOfBounds),
        }
    }
}

/// A value provided by the embedder to satisfy an import.
#[derive(Clone)]
pub enum HostValue {
    Func(HostFuncBody),
    Global(Ref<GlobalInstance>),
    Mem(Ref<MemoryInstance>),
    Table(Ref<TableInstance>),
}

impl HostValue {
    pub fn kind(&self) -> ExternKind {
        match self {
            Self::Func(_) => ExternKind::Func,
            Self::Global(_) => ExternKind::Global,
            Self::Mem(_) => ExternKind::Memory,
            Self::Table(_) => ExternKind::Table,
        }
    }

    pub fn global(value: Value, mutable: bool) -> Self {
        let ty = super::types::GlobalType {
            content: value.value_type(),
            mutable,
        };
        Self::Global(Rc::new(RefCell::new(GlobalInstance::new(value, ty))))
    }

    pub fn memory(initial: u32, maximum: Option<u32>) -> Self {
        Self::Mem(Rc::new(RefCell::new(MemoryInstance::new(initial, maximum))))
    }

    pub fn table(initial: u32, maximum: Option<u32>) -> Self {
        Self::Table(Rc::new(RefCell::new(TableInstance::new(initial, maximum))))
    }
}

type HostCode = dyn Fn(&[Value], &mut Vec<Value>, &HostContext) -> Result<(), Trap>;

/// A host function: a signature plus the closure implementing it. Cloning
/// shares the closure, so one import set can back several instances.
#[derive(Clone)]
pub struct HostFuncBody {
    ty: FuncType,
    code: Rc<HostCode>,
}

impl HostFuncBody {
    pub fn new<F>(ty: FuncType, code: F) -> Self
    where
        F: Fn(&[Value], &mut Vec<Value>, &HostContext) -> Result<(), Trap>,
        F: 'static,
    {
        Self {
            ty,
            code: Rc::new(code),
        }
    }

    pub(crate) fn call(
        &self,
        params: &[Value],
        results: &mut Vec<Value>,
        ctx: &HostContext,
    ) -> Result<(), Trap> {
        (self.code)(params, results, ctx)
    }

    pub fn ty(&self) -> &FuncType {
        &self.ty
    }
}

impl std::fmt::Debug for HostFuncBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFuncBody").field("ty", &self.ty).finish()
    }
}
