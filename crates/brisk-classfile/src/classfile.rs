use crate::constant_pool::{Constant, ConstantPool};
use crate::error::{Error, Result};
use crate::reader::Reader;

/// Access flag bits shared by classes and members.
pub mod access {
    pub const PUBLIC: u16 = 0x0001;
    pub const PRIVATE: u16 = 0x0002;
    pub const PROTECTED: u16 = 0x0004;
    pub const STATIC: u16 = 0x0008;
    pub const FINAL: u16 = 0x0010;
    pub const SUPER: u16 = 0x0020;
    pub const INTERFACE: u16 = 0x0200;
    pub const ABSTRACT: u16 = 0x0400;
    pub const SYNTHETIC: u16 = 0x1000;
}

/// Value of a `ConstantValue` attribute. Floating point values keep their bit patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstValue {
    Int(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    String(String),
}

#[derive(Debug, Clone)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub access_flags: u16,
    pub this_class: String,
    pub super_class: Option<String>,
    pub interfaces: Vec<String>,
    pub fields: Vec<ClassMember>,
    pub methods: Vec<ClassMember>,
    pub source_file: Option<String>,
    /// Access flags recorded for this class in its own `InnerClasses` entry, for nested classes.
    pub inner_access_flags: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct ClassMember {
    pub access_flags: u16,
    pub name: String,
    pub descriptor: String,
    pub constant_value: Option<ConstValue>,
    pub exceptions: Vec<String>,
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let magic = reader.read_u4()?;
        if magic != 0xCAFEBABE {
            return Err(Error::InvalidMagic(magic));
        }

        let minor_version = reader.read_u2()?;
        let major_version = reader.read_u2()?;
        let cp = ConstantPool::parse(&mut reader)?;

        let access_flags = reader.read_u2()?;
        let this_class = cp.get_class_name(reader.read_u2()?)?;
        let super_class_idx = reader.read_u2()?;
        let super_class = if super_class_idx == 0 {
            None
        } else {
            Some(cp.get_class_name(super_class_idx)?)
        };

        let interfaces_count = reader.read_u2()? as usize;
        let mut interfaces = Vec::with_capacity(interfaces_count);
        for _ in 0..interfaces_count {
            interfaces.push(cp.get_class_name(reader.read_u2()?)?);
        }

        let fields_count = reader.read_u2()? as usize;
        let mut fields = Vec::with_capacity(fields_count);
        for _ in 0..fields_count {
            fields.push(parse_member(&mut reader, &cp)?);
        }

        let methods_count = reader.read_u2()? as usize;
        let mut methods = Vec::with_capacity(methods_count);
        for _ in 0..methods_count {
            methods.push(parse_member(&mut reader, &cp)?);
        }

        let class_attrs = parse_attributes(&mut reader, &cp, Some(&this_class))?;

        reader.ensure_empty()?;

        Ok(Self {
            minor_version,
            major_version,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            source_file: class_attrs.source_file,
            inner_access_flags: class_attrs.inner_access_flags,
        })
    }
}

fn parse_member(reader: &mut Reader<'_>, cp: &ConstantPool) -> Result<ClassMember> {
    let access_flags = reader.read_u2()?;
    let name = cp.get_utf8(reader.read_u2()?)?.to_string();
    let descriptor = cp.get_utf8(reader.read_u2()?)?.to_string();

    let attrs = parse_attributes(reader, cp, None)?;
    Ok(ClassMember {
        access_flags,
        name,
        descriptor,
        constant_value: attrs.constant_value,
        exceptions: attrs.exceptions,
    })
}

#[derive(Default)]
struct ParsedAttributes {
    constant_value: Option<ConstValue>,
    exceptions: Vec<String>,
    source_file: Option<String>,
    inner_access_flags: Option<u16>,
}

/// Parses an attribute table. `this_class` is set for the class-level table.
fn parse_attributes(
    reader: &mut Reader<'_>,
    cp: &ConstantPool,
    this_class: Option<&str>,
) -> Result<ParsedAttributes> {
    let attributes_count = reader.read_u2()? as usize;
    let mut parsed = ParsedAttributes::default();
    for _ in 0..attributes_count {
        let name_index = reader.read_u2()?;
        let length = reader.read_u4()? as usize;
        let info = reader.read_bytes(length)?;
        let name = cp.get_utf8(name_index)?;

        let mut sub = Reader::new(info);
        match (name, this_class) {
            ("ConstantValue", None) => {
                let index = sub.read_u2()?;
                let value = match cp.get(index)? {
                    Constant::Integer(v) => ConstValue::Int(*v),
                    Constant::Float(v) => ConstValue::Float(*v),
                    Constant::Long(v) => ConstValue::Long(*v),
                    Constant::Double(v) => ConstValue::Double(*v),
                    Constant::String { string_index } => {
                        ConstValue::String(cp.get_utf8(*string_index)?.to_string())
                    }
                    _ => return Err(Error::MalformedAttribute("ConstantValue")),
                };
                parsed.constant_value = Some(value);
                sub.ensure_empty()?;
            }
            ("Exceptions", None) => {
                let num = sub.read_u2()? as usize;
                let mut exceptions = Vec::with_capacity(num);
                for _ in 0..num {
                    exceptions.push(cp.get_class_name(sub.read_u2()?)?);
                }
                parsed.exceptions.extend(exceptions);
                sub.ensure_empty()?;
            }
            ("SourceFile", Some(_)) => {
                parsed.source_file = Some(cp.get_utf8(sub.read_u2()?)?.to_string());
                sub.ensure_empty()?;
            }
            ("InnerClasses", Some(this_class)) => {
                let num = sub.read_u2()? as usize;
                for _ in 0..num {
                    let inner_class_info_index = sub.read_u2()?;
                    let _outer_class_info_index = sub.read_u2()?;
                    let _inner_name_index = sub.read_u2()?;
                    let inner_access_flags = sub.read_u2()?;
                    if cp.get_class_name(inner_class_info_index)? == this_class {
                        parsed.inner_access_flags = Some(inner_access_flags);
                    }
                }
                sub.ensure_empty()?;
            }
            _ => {
                // Code, debug tables, annotations, and anything unknown carry no ABI.
            }
        }
    }

    Ok(parsed)
}
