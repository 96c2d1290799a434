//! Decoding of the binary format into a [`Module`].
//! Spec: https://webassembly.github.io/spec/core/binary/modules.html

use crate::inst::read_expr;
use crate::module::{
    ConstExpr, DataMode, DataSegment, ElementMode, ElementSegment, Export, FunctionBody,
    GlobalDecl, Import, ImportDesc, Module, ModuleInner,
};
use crate::types::{ExternKind, FuncType, GlobalType, Limits, MemoryType, TableType, ValType};
use std::collections::HashMap;
use std::convert::TryFrom;
use wasmparser::{
    BinaryReaderError, DataKind, ElementItem, ElementKind, ExternalKind, Name, NameSectionReader,
    OperatorsReader, Parser, Payload, SectionReader, SectionWithLimitedItems, Type, TypeRef,
};

const MAGIC: &[u8; 4] = b"\0asm";
const VERSION: &[u8; 4] = &[1, 0, 0, 0];
const MAX_LOCALS: u64 = 50_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("magic header not detected or unknown binary version")]
    BadHeader,
    #[error("unexpected end of section or function at offset {offset}")]
    Truncated { offset: usize },
    #[error("malformed module at offset {offset}: {message}")]
    Malformed { offset: usize, message: String },
    #[error("unsupported feature at offset {offset}: {feature}")]
    Unsupported { offset: usize, feature: &'static str },
}

impl LoadError {
    pub(crate) fn malformed(offset: usize, message: impl Into<String>) -> Self {
        Self::Malformed {
            offset,
            message: message.into(),
        }
    }
}

impl From<BinaryReaderError> for LoadError {
    /// Reads that run off the end of the input, a section or a function body
    /// are truncations. Everything else the reader rejects is malformed.
    fn from(err: BinaryReaderError) -> Self {
        if err.message().contains("unexpected end") {
            Self::Truncated {
                offset: err.offset(),
            }
        } else {
            Self::malformed(err.offset(), err.message())
        }
    }
}

type Result<T> = std::result::Result<T, LoadError>;

/// Position of a known section in the required section order.
fn section_rank(payload: &Payload<'_>) -> Option<u8> {
    let rank = match payload {
        Payload::TypeSection(_) => 1,
        Payload::ImportSection(_) => 2,
        Payload::FunctionSection(_) => 3,
        Payload::TableSection(_) => 4,
        Payload::MemorySection(_) => 5,
        Payload::GlobalSection(_) => 6,
        Payload::ExportSection(_) => 7,
        Payload::StartSection { .. } => 8,
        Payload::ElementSection(_) => 9,
        // data count sits between element and code
        Payload::DataCountSection { .. } => 10,
        Payload::CodeSectionStart { .. } => 11,
        Payload::DataSection(_) => 12,
        _ => return None,
    };
    Some(rank)
}

/// Decodes `bytes` into an unvalidated module.
pub fn load(bytes: &[u8]) -> Result<Module> {
    if bytes.len() < 8 || &bytes[0..4] != MAGIC || &bytes[4..8] != VERSION {
        return Err(LoadError::BadHeader);
    }
    let mut module = ModuleInner::default();
    let mut func_decls: Vec<u32> = Vec::new();
    let mut last_rank = 0;
    let end_offset = bytes.len();

    for payload in Parser::new(0).parse_all(bytes) {
        let payload = payload?;
        if let Some(rank) = section_rank(&payload) {
            if rank <= last_rank {
                return Err(LoadError::malformed(
                    section_offset(&payload),
                    "unexpected or duplicate section",
                ));
            }
            last_rank = rank;
        }

        match payload {
            Payload::TypeSection(section) => {
                let offset = section.original_position();
                for ty in section {
                    match ty? {
                        Type::Func(ty) => module.types.push(func_type(&ty, offset)?),
                        #[allow(unreachable_patterns)]
                        _ => {
                            return Err(LoadError::Unsupported {
                                offset,
                                feature: "non-function types",
                            })
                        }
                    }
                }
            }
            Payload::ImportSection(section) => {
                let offset = section.original_position();
                for import in section {
                    module.imports.push(read_import(import?, offset)?);
                }
            }
            Payload::FunctionSection(section) => {
                for type_index in section {
                    func_decls.push(type_index?);
                }
            }
            Payload::TableSection(section) => {
                let offset = section.original_position();
                for table in section {
                    module.tables.push(table_type(&table?, offset)?);
                }
            }
            Payload::MemorySection(section) => {
                let offset = section.original_position();
                for memory in section {
                    module.memories.push(memory_type(&memory?, offset)?);
                }
            }
            Payload::GlobalSection(section) => {
                let offset = section.original_position();
                for global in section {
                    let global = global?;
                    module.globals.push(GlobalDecl {
                        ty: global_type(&global.ty, offset)?,
                        init: read_const_expr(global.init_expr.get_operators_reader())?,
                    });
                }
            }
            Payload::ExportSection(section) => {
                let offset = section.original_position();
                for export in section {
                    let export = export?;
                    let kind = match export.kind {
                        ExternalKind::Func => ExternKind::Func,
                        ExternalKind::Table => ExternKind::Table,
                        ExternalKind::Memory => ExternKind::Memory,
                        ExternalKind::Global => ExternKind::Global,
                        _ => {
                            return Err(LoadError::Unsupported {
                                offset,
                                feature: "exception handling",
                            })
                        }
                    };
                    module.exports.push(Export {
                        name: export.name.to_string(),
                        kind,
                        index: export.index,
                    });
                }
            }
            Payload::StartSection { func, .. } => module.start = Some(func),
            Payload::ElementSection(section) => {
                for element in section {
                    module.elements.push(read_element(element?)?);
                }
            }
            Payload::DataCountSection { count, .. } => module.data_count = Some(count),
            Payload::CodeSectionEntry(body) => module.code.push(read_body(body)?),
            Payload::DataSection(section) => {
                for data in section {
                    let data = data?;
                    let mode = match data.kind {
                        DataKind::Passive => DataMode::Passive,
                        DataKind::Active {
                            memory_index,
                            offset_expr,
                        } => DataMode::Active {
                            memory_index,
                            offset: read_const_expr(offset_expr.get_operators_reader())?,
                        },
                    };
                    module.data.push(DataSegment {
                        mode,
                        bytes: data.data.to_vec(),
                    });
                }
            }
            Payload::CustomSection(section) if section.name() == "name" => {
                // names are debug information, a broken section is not fatal
                match read_function_names(section.data(), section.data_offset()) {
                    Ok(names) => module.func_names = names,
                    Err(err) => log::debug!("ignoring malformed name section: {}", err),
                }
            }
            Payload::UnknownSection { id, contents, .. } => {
                log::trace!("skipping unknown section id {} ({} bytes)", id, contents.len());
            }
            Payload::TagSection(section) => {
                return Err(LoadError::Unsupported {
                    offset: section.original_position(),
                    feature: "exception handling",
                })
            }
            _ => {}
        }
    }

    if func_decls.len() != module.code.len() {
        return Err(LoadError::malformed(
            end_offset,
            "function and code section have inconsistent lengths",
        ));
    }
    if let Some(count) = module.data_count {
        if count as usize != module.data.len() {
            return Err(LoadError::malformed(
                end_offset,
                "data count and data section have inconsistent lengths",
            ));
        }
    }
    for (body, type_index) in module.code.iter_mut().zip(func_decls) {
        body.type_index = type_index;
    }
    module.func_types = module
        .imports
        .iter()
        .filter_map(|import| match import.desc {
            ImportDesc::Func(ty) => Some(ty),
            _ => None,
        })
        .chain(module.code.iter().map(|body| body.type_index))
        .collect();

    log::debug!(
        "loaded module: {} types, {} imports, {} functions, {} exports",
        module.types.len(),
        module.imports.len(),
        module.code.len(),
        module.exports.len()
    );
    Ok(Module::from_inner(module))
}

fn section_offset(payload: &Payload<'_>) -> usize {
    match payload {
        Payload::StartSection { range, .. }
        | Payload::DataCountSection { range, .. }
        | Payload::CodeSectionStart { range, .. } => range.start,
        Payload::TypeSection(section) => section.original_position(),
        Payload::ImportSection(section) => section.original_position(),
        Payload::FunctionSection(section) => section.original_position(),
        Payload::TableSection(section) => section.original_position(),
        Payload::MemorySection(section) => section.original_position(),
        Payload::GlobalSection(section) => section.original_position(),
        Payload::ExportSection(section) => section.original_position(),
        Payload::ElementSection(section) => section.original_position(),
        Payload::DataSection(section) => section.original_position(),
        _ => 0,
    }
}

pub(crate) fn val_type(ty: wasmparser::ValType, offset: usize) -> Result<ValType> {
    match ty {
        wasmparser::ValType::I32 => Ok(ValType::I32),
        wasmparser::ValType::I64 => Ok(ValType::I64),
        wasmparser::ValType::F32 => Ok(ValType::F32),
        wasmparser::ValType::F64 => Ok(ValType::F64),
        wasmparser::ValType::V128 => Err(LoadError::Unsupported {
            offset,
            feature: "SIMD",
        }),
        _ => Err(LoadError::Unsupported {
            offset,
            feature: "reference types",
        }),
    }
}

fn func_type(ty: &wasmparser::FuncType, offset: usize) -> Result<FuncType> {
    let params = ty
        .params()
        .iter()
        .map(|ty| val_type(*ty, offset))
        .collect::<Result<Vec<_>>>()?;
    let results = ty
        .results()
        .iter()
        .map(|ty| val_type(*ty, offset))
        .collect::<Result<Vec<_>>>()?;
    Ok(FuncType::new(params, results))
}

fn table_type(ty: &wasmparser::TableType, offset: usize) -> Result<TableType> {
    if ty.element_type != wasmparser::ValType::FuncRef {
        return Err(LoadError::Unsupported {
            offset,
            feature: "reference types",
        });
    }
    Ok(TableType {
        limits: Limits {
            min: ty.initial,
            max: ty.maximum,
        },
    })
}

fn memory_type(ty: &wasmparser::MemoryType, offset: usize) -> Result<MemoryType> {
    if ty.memory64 {
        return Err(LoadError::Unsupported {
            offset,
            feature: "memory64",
        });
    }
    if ty.shared {
        return Err(LoadError::Unsupported {
            offset,
            feature: "shared memory",
        });
    }
    let page_count = |pages: u64| {
        u32::try_from(pages).map_err(|_| LoadError::malformed(offset, "integer too large"))
    };
    Ok(MemoryType {
        limits: Limits {
            min: page_count(ty.initial)?,
            max: ty.maximum.map(page_count).transpose()?,
        },
    })
}

fn global_type(ty: &wasmparser::GlobalType, offset: usize) -> Result<GlobalType> {
    Ok(GlobalType {
        content: val_type(ty.content_type, offset)?,
        mutable: ty.mutable,
    })
}

fn read_const_expr(mut reader: OperatorsReader<'_>) -> Result<ConstExpr> {
    let offset = reader.original_position();
    let instructions = read_expr(&mut reader)?;
    Ok(ConstExpr {
        offset,
        instructions,
    })
}

fn read_import(import: wasmparser::Import<'_>, offset: usize) -> Result<Import> {
    let desc = match import.ty {
        TypeRef::Func(type_index) => ImportDesc::Func(type_index),
        TypeRef::Table(ty) => ImportDesc::Table(table_type(&ty, offset)?),
        TypeRef::Memory(ty) => ImportDesc::Memory(memory_type(&ty, offset)?),
        TypeRef::Global(ty) => ImportDesc::Global(global_type(&ty, offset)?),
        _ => {
            return Err(LoadError::Unsupported {
                offset,
                feature: "exception handling",
            })
        }
    };
    Ok(Import {
        module: import.module.to_string(),
        field: import.name.to_string(),
        desc,
    })
}

fn read_element(element: wasmparser::Element<'_>) -> Result<ElementSegment> {
    let mode = match element.kind {
        ElementKind::Passive => ElementMode::Passive,
        ElementKind::Declared => ElementMode::Declared,
        ElementKind::Active {
            table_index,
            offset_expr,
        } => ElementMode::Active {
            table_index,
            offset: read_const_expr(offset_expr.get_operators_reader())?,
        },
    };
    let mut items = element.items.get_items_reader()?;
    let offset = items.original_position();
    let mut funcs = Vec::new();
    for _ in 0..items.get_count() {
        match items.read()? {
            ElementItem::Func(index) => funcs.push(index),
            ElementItem::Expr(_) => {
                return Err(LoadError::Unsupported {
                    offset,
                    feature: "element segment expressions",
                })
            }
        }
    }
    Ok(ElementSegment { mode, funcs })
}

fn read_body(body: wasmparser::FunctionBody<'_>) -> Result<FunctionBody> {
    let mut locals_reader = body.get_locals_reader()?;
    let mut locals = Vec::new();
    let mut total: u64 = 0;
    for _ in 0..locals_reader.get_count() {
        let offset = locals_reader.original_position();
        let (n, ty) = locals_reader.read()?;
        total += n as u64;
        if total > MAX_LOCALS {
            return Err(LoadError::malformed(offset, "too many locals"));
        }
        locals.extend(std::iter::repeat(val_type(ty, offset)?).take(n as usize));
    }

    let mut reader = body.get_operators_reader()?;
    let instructions = read_expr(&mut reader)?;
    if !reader.eof() {
        return Err(LoadError::malformed(
            reader.original_position(),
            "operators remaining after end of function",
        ));
    }
    Ok(FunctionBody {
        type_index: 0,
        locals,
        instructions,
    })
}

fn read_function_names(
    data: &[u8],
    offset: usize,
) -> std::result::Result<HashMap<u32, String>, BinaryReaderError> {
    let mut reader = NameSectionReader::new(data, offset)?;
    let mut names = HashMap::new();
    while !reader.eof() {
        if let Name::Function(map) = reader.read()? {
            let mut map = map;
            for _ in 0..map.get_count() {
                let naming = map.read()?;
                names.insert(naming.index, naming.name.to_string());
            }
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: [u8; 8] = [0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00];

    fn with_header(sections: &[u8]) -> Vec<u8> {
        let mut bytes = HEADER.to_vec();
        bytes.extend_from_slice(sections);
        bytes
    }

    #[test]
    fn empty_module() {
        let module = load(&HEADER).unwrap();
        assert!(module.types().is_empty());
        assert!(module.exports().is_empty());
    }

    #[test]
    fn bad_header() {
        assert_eq!(load(b"\0asm").unwrap_err(), LoadError::BadHeader);
        assert_eq!(
            load(&[0x00, 0x61, 0x73, 0x6D, 0x02, 0x00, 0x00, 0x00]).unwrap_err(),
            LoadError::BadHeader
        );
        assert_eq!(
            load(&[0x00, 0x61, 0x73, 0x6E, 0x01, 0x00, 0x00, 0x00]).unwrap_err(),
            LoadError::BadHeader
        );
    }

    #[test]
    fn declared_length_beyond_input_is_truncated() {
        // type section claims 16 bytes but only 4 follow
        let bytes = with_header(&[0x01, 0x10, 0x01, 0x60, 0x00, 0x00]);
        assert!(matches!(load(&bytes), Err(LoadError::Truncated { .. })));
    }

    #[test]
    fn payload_ending_early_is_truncated() {
        // type section of 2 bytes declaring one type without its vectors
        let bytes = with_header(&[0x01, 0x02, 0x01, 0x60]);
        assert!(matches!(load(&bytes), Err(LoadError::Truncated { .. })));
    }

    #[test]
    fn unknown_sections_are_skipped() {
        let bytes = with_header(&[0x2A, 0x03, 0xDE, 0xAD, 0xBE, 0x01, 0x04, 0x01, 0x60, 0x00, 0x00]);
        let module = load(&bytes).unwrap();
        assert_eq!(module.types(), &[FuncType::default()]);
    }

    #[test]
    fn duplicate_section_is_malformed() {
        let bytes = with_header(&[0x01, 0x01, 0x00, 0x01, 0x01, 0x00]);
        assert!(matches!(load(&bytes), Err(LoadError::Malformed { .. })));
    }

    #[test]
    fn out_of_order_section_is_malformed() {
        // function section before the type section
        let bytes = with_header(&[0x03, 0x01, 0x00, 0x01, 0x01, 0x00]);
        assert!(matches!(load(&bytes), Err(LoadError::Malformed { .. })));
    }

    #[test]
    fn function_without_body_is_malformed() {
        // one type, one function declaration, no code section
        let bytes = with_header(&[0x01, 0x04, 0x01, 0x60, 0x00, 0x00, 0x03, 0x02, 0x01, 0x00]);
        assert!(matches!(load(&bytes), Err(LoadError::Malformed { .. })));
    }

    #[test]
    fn invalid_value_type_is_malformed() {
        let bytes = with_header(&[0x01, 0x05, 0x01, 0x60, 0x01, 0x55, 0x00]);
        assert!(matches!(load(&bytes), Err(LoadError::Malformed { .. })));
    }

    #[test]
    fn trailing_section_bytes_are_malformed() {
        // an empty type vector followed by one stray byte
        let bytes = with_header(&[0x01, 0x02, 0x00, 0x00]);
        assert!(matches!(load(&bytes), Err(LoadError::Malformed { .. })));
    }

    #[test]
    fn shared_memory_is_unsupported() {
        let bytes = with_header(&[0x05, 0x04, 0x01, 0x03, 0x01, 0x01]);
        assert!(matches!(
            load(&bytes),
            Err(LoadError::Unsupported {
                feature: "shared memory",
                ..
            })
        ));
    }
}
