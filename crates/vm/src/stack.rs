use super::value::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("pop from empty stack")]
    PopEmptyStack,
    #[error("no call frame")]
    NoCallFrame,
    #[error("no label at depth {0}")]
    NoLabel(usize),
    #[error("local {0} out of range")]
    NoLocal(usize),
    #[error("call stack exhausted")]
    Overflow,
}

type Result<T> = std::result::Result<T, Error>;

/// A branch target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label {
    /// Number of values a branch to this label carries
    pub arity: usize,
    /// Instruction index a branch resumes at
    pub continuation: usize,
}

#[derive(Clone, Copy, Debug)]
struct LabelEntry {
    label: Label,
    /// Value stack height below the block's parameters
    height: usize,
}

#[derive(Clone, Debug)]
pub struct CallFrame {
    pub func_index: u32,
    pub body_index: usize,
    pub locals: Vec<Value>,
    pub arity: usize,
    /// Caller's body and instruction to resume, `None` for the entry frame
    pub ret_pc: Option<(usize, usize)>,
    label_base: usize,
    value_base: usize,
}

impl CallFrame {
    pub fn new(
        func_index: u32,
        body_index: usize,
        locals: Vec<Value>,
        arity: usize,
        ret_pc: Option<(usize, usize)>,
    ) -> Self {
        Self {
            func_index,
            body_index,
            locals,
            arity,
            ret_pc,
            label_base: 0,
            value_base: 0,
        }
    }
}

/// Value, label and call-frame stacks of one invocation.
pub struct Stack {
    values: Vec<Value>,
    labels: Vec<LabelEntry>,
    frames: Vec<CallFrame>,
    max_frames: usize,
}

impl Stack {
    pub fn new(max_frames: usize) -> Self {
        Self {
            values: Vec::new(),
            labels: Vec::new(),
            frames: Vec::new(),
            max_frames,
        }
    }

    pub fn push_value(&mut self, val: Value) {
        self.values.push(val)
    }

    pub fn push_values<I: IntoIterator<Item = Value>>(&mut self, vals: I) {
        self.values.extend(vals)
    }

    pub fn pop_value(&mut self) -> Result<Value> {
        self.values.pop().ok_or(Error::PopEmptyStack)
    }

    /// Pops `n` values, returned in push order.
    pub fn pop_values(&mut self, n: usize) -> Result<Vec<Value>> {
        if n > self.values.len() {
            return Err(Error::PopEmptyStack);
        }
        let at = self.values.len() - n;
        Ok(self.values.split_off(at))
    }

    /// Pushes a label whose block consumes the top `params` values.
    pub fn push_label(&mut self, label: Label, params: usize) -> Result<()> {
        let height = self
            .values
            .len()
            .checked_sub(params)
            .ok_or(Error::PopEmptyStack)?;
        self.labels.push(LabelEntry { label, height });
        Ok(())
    }

    pub fn pop_label(&mut self) -> Result<Label> {
        let base = self.current_frame()?.label_base;
        if self.labels.len() <= base {
            return Err(Error::NoLabel(0));
        }
        self.labels
            .pop()
            .map(|entry| entry.label)
            .ok_or(Error::NoLabel(0))
    }

    /// Number of labels in the current frame.
    pub fn label_depth(&self) -> Result<usize> {
        Ok(self.labels.len() - self.current_frame()?.label_base)
    }

    /// Unwinds to the label `depth` levels out, keeping its arity's worth of
    /// values on top of the stack, and returns it.
    pub fn unwind_to_label(&mut self, depth: usize) -> Result<Label> {
        let label_depth = self.label_depth()?;
        if depth >= label_depth {
            return Err(Error::NoLabel(depth));
        }
        let index = self.labels.len() - depth - 1;
        let entry = self.labels[index];
        let results = self.pop_values(entry.label.arity)?;
        self.values.truncate(entry.height);
        self.values.extend(results);
        self.labels.truncate(index);
        Ok(entry.label)
    }

    pub fn push_frame(&mut self, mut frame: CallFrame) -> Result<()> {
        if self.frames.len() >= self.max_frames {
            return Err(Error::Overflow);
        }
        frame.label_base = self.labels.len();
        frame.value_base = self.values.len();
        self.frames.push(frame);
        Ok(())
    }

    /// Pops the current frame, leaving only its results above the caller's values.
    pub fn pop_frame(&mut self) -> Result<CallFrame> {
        let frame = self.frames.pop().ok_or(Error::NoCallFrame)?;
        let results = self.pop_values(frame.arity)?;
        self.values.truncate(frame.value_base);
        self.values.extend(results);
        self.labels.truncate(frame.label_base);
        Ok(frame)
    }

    pub fn current_frame(&self) -> Result<&CallFrame> {
        self.frames.last().ok_or(Error::NoCallFrame)
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn local(&self, index: usize) -> Result<Value> {
        self.current_frame()?
            .locals
            .get(index)
            .copied()
            .ok_or(Error::NoLocal(index))
    }

    pub fn set_local(&mut self, index: usize, value: Value) -> Result<()> {
        let frame = self.frames.last_mut().ok_or(Error::NoCallFrame)?;
        let slot = frame.locals.get_mut(index).ok_or(Error::NoLocal(index))?;
        *slot = value;
        Ok(())
    }

    pub fn is_over_top_level(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "┌-------------------------┐")?;
        writeln!(f, "|--------- Stack ---------|")?;
        for value in &self.values {
            writeln!(f, "| Value({}) | {} |", value.value_type(), value)?;
        }
        for entry in &self.labels {
            writeln!(f, "| Label | {:?} @ {} |", entry.label, entry.height)?;
        }
        for frame in &self.frames {
            writeln!(f, "| Frame | func {} |", frame.func_index)?;
        }
        writeln!(f, "└-------------------------┘")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(arity: usize) -> CallFrame {
        CallFrame::new(0, 0, vec![Value::I32(0)], arity, None)
    }

    #[test]
    fn branch_keeps_only_label_results() {
        let mut stack = Stack::new(4);
        stack.push_frame(frame(1)).unwrap();
        stack.push_value(Value::I32(1));
        stack
            .push_label(
                Label {
                    arity: 1,
                    continuation: 9,
                },
                0,
            )
            .unwrap();
        stack.push_values(vec![Value::I32(2), Value::I32(3)]);
        stack
            .push_label(
                Label {
                    arity: 0,
                    continuation: 5,
                },
                1,
            )
            .unwrap();
        let label = stack.unwind_to_label(1).unwrap();
        assert_eq!(label.continuation, 9);
        assert_eq!(stack.label_depth().unwrap(), 0);
        assert_eq!(stack.pop_values(2).unwrap(), vec![Value::I32(1), Value::I32(3)]);
        assert!(stack.unwind_to_label(0).is_err());
    }

    #[test]
    fn frames_are_limited_and_isolated() {
        let mut stack = Stack::new(2);
        stack.push_value(Value::I64(7));
        stack.push_frame(frame(1)).unwrap();
        stack.push_frame(frame(0)).unwrap();
        assert_eq!(stack.push_frame(frame(0)).unwrap_err(), Error::Overflow);
        assert_eq!(stack.frame_count(), 2);
        stack.pop_frame().unwrap();
        assert_eq!(stack.frame_count(), 1);
        stack.push_values(vec![Value::I32(4), Value::I32(5)]);
        stack.set_local(0, Value::I32(9)).unwrap();
        assert_eq!(stack.local(0).unwrap(), Value::I32(9));
        stack.pop_frame().unwrap();
        assert!(stack.is_over_top_level());
        assert_eq!(stack.into_values(), vec![Value::I64(7), Value::I32(5)]);
    }
}
