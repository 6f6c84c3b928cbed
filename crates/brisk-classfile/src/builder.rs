use std::collections::HashMap;

use crate::classfile::{access, ConstValue};

#[derive(Default)]
struct PoolWriter {
    bytes: Vec<u8>,
    next: u16,
    utf8: HashMap<String, u16>,
    classes: HashMap<String, u16>,
}

impl PoolWriter {
    fn new() -> Self {
        Self {
            next: 1,
            ..Self::default()
        }
    }

    fn push(&mut self, tag: u8, payload: &[u8], slots: u16) -> u16 {
        let index = self.next;
        self.bytes.push(tag);
        self.bytes.extend_from_slice(payload);
        self.next += slots;
        index
    }

    // Names used in tests are ASCII, whose modified UTF-8 form is plain UTF-8.
    fn utf8(&mut self, text: &str) -> u16 {
        if let Some(index) = self.utf8.get(text) {
            return *index;
        }
        let mut payload = (text.len() as u16).to_be_bytes().to_vec();
        payload.extend_from_slice(text.as_bytes());
        let index = self.push(1, &payload, 1);
        self.utf8.insert(text.to_string(), index);
        index
    }

    fn class(&mut self, name: &str) -> u16 {
        if let Some(index) = self.classes.get(name) {
            return *index;
        }
        let name_index = self.utf8(name);
        let index = self.push(7, &name_index.to_be_bytes(), 1);
        self.classes.insert(name.to_string(), index);
        index
    }

    fn constant(&mut self, value: &ConstValue) -> u16 {
        match value {
            ConstValue::Int(v) => self.push(3, &v.to_be_bytes(), 1),
            ConstValue::Float(v) => self.push(4, &v.to_be_bytes(), 1),
            ConstValue::Long(v) => self.push(5, &v.to_be_bytes(), 2),
            ConstValue::Double(v) => self.push(6, &v.to_be_bytes(), 2),
            ConstValue::String(text) => {
                let string_index = self.utf8(text);
                self.push(8, &string_index.to_be_bytes(), 1)
            }
        }
    }
}

/// A field or method to emit.
#[derive(Debug, Clone)]
pub struct MemberBuilder {
    access_flags: u16,
    name: String,
    descriptor: String,
    constant_value: Option<ConstValue>,
    exceptions: Vec<String>,
    code: Option<(Vec<u8>, Vec<(u16, u16)>)>,
}

impl MemberBuilder {
    pub fn new(access_flags: u16, name: &str, descriptor: &str) -> Self {
        Self {
            access_flags,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            constant_value: None,
            exceptions: Vec::new(),
            code: None,
        }
    }

    pub fn constant(mut self, value: ConstValue) -> Self {
        self.constant_value = Some(value);
        self
    }

    pub fn throws(mut self, class: &str) -> Self {
        self.exceptions.push(class.to_string());
        self
    }

    /// Attaches a `Code` attribute with the given bytecode and `LineNumberTable` entries.
    pub fn code(mut self, bytecode: &[u8], line_numbers: &[(u16, u16)]) -> Self {
        self.code = Some((bytecode.to_vec(), line_numbers.to_vec()));
        self
    }

    fn write(&self, pool: &mut PoolWriter, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.access_flags.to_be_bytes());
        out.extend_from_slice(&pool.utf8(&self.name).to_be_bytes());
        out.extend_from_slice(&pool.utf8(&self.descriptor).to_be_bytes());

        let mut attributes: Vec<(u16, Vec<u8>)> = Vec::new();
        if let Some(value) = &self.constant_value {
            let name = pool.utf8("ConstantValue");
            attributes.push((name, pool.constant(value).to_be_bytes().to_vec()));
        }
        if !self.exceptions.is_empty() {
            let name = pool.utf8("Exceptions");
            let mut info = (self.exceptions.len() as u16).to_be_bytes().to_vec();
            for exception in &self.exceptions {
                info.extend_from_slice(&pool.class(exception).to_be_bytes());
            }
            attributes.push((name, info));
        }
        if let Some((bytecode, lines)) = &self.code {
            let name = pool.utf8("Code");
            let mut info = Vec::new();
            info.extend_from_slice(&2_u16.to_be_bytes()); // max_stack
            info.extend_from_slice(&2_u16.to_be_bytes()); // max_locals
            info.extend_from_slice(&(bytecode.len() as u32).to_be_bytes());
            info.extend_from_slice(bytecode);
            info.extend_from_slice(&0_u16.to_be_bytes()); // exception table
            if lines.is_empty() {
                info.extend_from_slice(&0_u16.to_be_bytes());
            } else {
                info.extend_from_slice(&1_u16.to_be_bytes());
                let mut table = (lines.len() as u16).to_be_bytes().to_vec();
                for (pc, line) in lines {
                    table.extend_from_slice(&pc.to_be_bytes());
                    table.extend_from_slice(&line.to_be_bytes());
                }
                info.extend_from_slice(&pool.utf8("LineNumberTable").to_be_bytes());
                info.extend_from_slice(&(table.len() as u32).to_be_bytes());
                info.extend_from_slice(&table);
            }
            attributes.push((name, info));
        }
        write_attributes(&attributes, out);
    }
}

/// Emits minimal but well-formed class files.
#[derive(Debug, Clone)]
pub struct ClassFileBuilder {
    major_version: u16,
    access_flags: u16,
    this_class: String,
    super_class: Option<String>,
    interfaces: Vec<String>,
    fields: Vec<MemberBuilder>,
    methods: Vec<MemberBuilder>,
    source_file: Option<String>,
    inner_access_flags: Option<u16>,
}

impl ClassFileBuilder {
    /// A public class extending `java/lang/Object`.
    pub fn new(this_class: &str) -> Self {
        Self {
            major_version: 52,
            access_flags: access::PUBLIC | access::SUPER,
            this_class: this_class.to_string(),
            super_class: Some("java/lang/Object".to_string()),
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            source_file: None,
            inner_access_flags: None,
        }
    }

    pub fn major_version(mut self, version: u16) -> Self {
        self.major_version = version;
        self
    }

    pub fn access(mut self, access_flags: u16) -> Self {
        self.access_flags = access_flags;
        self
    }

    pub fn super_class(mut self, super_class: Option<&str>) -> Self {
        self.super_class = super_class.map(str::to_string);
        self
    }

    pub fn interface(mut self, name: &str) -> Self {
        self.interfaces.push(name.to_string());
        self
    }

    pub fn field(mut self, field: MemberBuilder) -> Self {
        self.fields.push(field);
        self
    }

    pub fn method(mut self, method: MemberBuilder) -> Self {
        self.methods.push(method);
        self
    }

    pub fn source_file(mut self, name: &str) -> Self {
        self.source_file = Some(name.to_string());
        self
    }

    /// Records an `InnerClasses` entry for this class with the given flags.
    pub fn nested(mut self, inner_access_flags: u16) -> Self {
        self.inner_access_flags = Some(inner_access_flags);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut pool = PoolWriter::new();
        let mut body = Vec::new();

        body.extend_from_slice(&self.access_flags.to_be_bytes());
        body.extend_from_slice(&pool.class(&self.this_class).to_be_bytes());
        let super_index = match &self.super_class {
            Some(name) => pool.class(name),
            None => 0,
        };
        body.extend_from_slice(&super_index.to_be_bytes());

        body.extend_from_slice(&(self.interfaces.len() as u16).to_be_bytes());
        for interface in &self.interfaces {
            body.extend_from_slice(&pool.class(interface).to_be_bytes());
        }

        for members in [&self.fields, &self.methods] {
            body.extend_from_slice(&(members.len() as u16).to_be_bytes());
            for member in members {
                member.write(&mut pool, &mut body);
            }
        }

        let mut attributes: Vec<(u16, Vec<u8>)> = Vec::new();
        if let Some(source_file) = &self.source_file {
            let name = pool.utf8("SourceFile");
            attributes.push((name, pool.utf8(source_file).to_be_bytes().to_vec()));
        }
        if let Some(flags) = self.inner_access_flags {
            let name = pool.utf8("InnerClasses");
            let mut info = 1_u16.to_be_bytes().to_vec();
            info.extend_from_slice(&pool.class(&self.this_class).to_be_bytes());
            info.extend_from_slice(&0_u16.to_be_bytes());
            info.extend_from_slice(&0_u16.to_be_bytes());
            info.extend_from_slice(&flags.to_be_bytes());
            attributes.push((name, info));
        }
        write_attributes(&attributes, &mut body);

        let mut out = Vec::with_capacity(10 + pool.bytes.len() + body.len());
        out.extend_from_slice(&0xCAFEBABE_u32.to_be_bytes());
        out.extend_from_slice(&0_u16.to_be_bytes());
        out.extend_from_slice(&self.major_version.to_be_bytes());
        out.extend_from_slice(&pool.next.to_be_bytes());
        out.extend_from_slice(&pool.bytes);
        out.extend_from_slice(&body);
        out
    }
}

fn write_attributes(attributes: &[(u16, Vec<u8>)], out: &mut Vec<u8>) {
    out.extend_from_slice(&(attributes.len() as u16).to_be_bytes());
    for (name, info) in attributes {
        out.extend_from_slice(&name.to_be_bytes());
        out.extend_from_slice(&(info.len() as u32).to_be_bytes());
        out.extend_from_slice(info);
    }
}
