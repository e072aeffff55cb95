//! Assembling classfiles in memory

#![allow(dead_code)]

use byteorder::{BigEndian, WriteBytesExt};
use std::collections::HashMap;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_SUPER: u16 = 0x0020;

const TAG_UTF8: u8 = 1;
const TAG_INTEGER: u8 = 3;
const TAG_CLASS: u8 = 7;
const TAG_STRING: u8 = 8;
const TAG_FIELDREF: u8 = 9;
const TAG_METHODREF: u8 = 10;
const TAG_NAME_AND_TYPE: u8 = 12;

/// Verification type in a `StackMap` entry
#[derive(Copy, Clone)]
pub enum Item {
    Bogus,
    Int,
    Null,
    Object(u16),
}

impl Item {
    fn write(self, out: &mut Vec<u8>) {
        match self {
            Item::Bogus => out.push(0),
            Item::Int => out.push(1),
            Item::Null => out.push(5),
            Item::Object(class) => {
                out.push(7);
                out.write_u16::<BigEndian>(class).unwrap();
            }
        }
    }
}

/// Body of a `StackMap` attribute, from `(address, locals, stack)` entries
pub fn stack_map(entries: &[(u16, Vec<Item>, Vec<Item>)]) -> Vec<u8> {
    let mut out = vec![];
    out.write_u16::<BigEndian>(entries.len() as u16).unwrap();
    for (address, locals, stack) in entries {
        out.write_u16::<BigEndian>(*address).unwrap();
        for items in [locals, stack] {
            out.write_u16::<BigEndian>(items.len() as u16).unwrap();
            for item in items {
                item.write(&mut out);
            }
        }
    }
    out
}

#[derive(Default)]
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,

    /// `(start_pc, end_pc, handler_pc, catch_type)`
    pub handlers: Vec<(u16, u16, u16, u16)>,
    pub stack_map: Option<Vec<u8>>,

    /// `(start_pc, line)`
    pub line_numbers: Vec<(u16, u16)>,
}

pub struct ClassFileBuilder {
    access_flags: u16,
    this_class: u16,
    super_class: u16,
    constants: Vec<u8>,
    constant_count: u16,
    interned: HashMap<(u8, Vec<u8>), u16>,
    fields: Vec<Vec<u8>>,
    methods: Vec<Vec<u8>>,
    source_file: Option<u16>,
}

impl ClassFileBuilder {
    pub fn new(name: &str, superclass: &str) -> ClassFileBuilder {
        let mut builder = ClassFileBuilder {
            access_flags: ACC_PUBLIC | ACC_SUPER,
            this_class: 0,
            super_class: 0,
            constants: vec![],
            constant_count: 1,
            interned: HashMap::new(),
            fields: vec![],
            methods: vec![],
            source_file: None,
        };
        builder.this_class = builder.class(name);
        builder.super_class = builder.class(superclass);
        builder
    }

    fn constant(&mut self, tag: u8, payload: Vec<u8>) -> u16 {
        let key = (tag, payload);
        if let Some(&index) = self.interned.get(&key) {
            return index;
        }
        self.constants.push(tag);
        self.constants.extend_from_slice(&key.1);
        let index = self.constant_count;
        self.constant_count += 1;
        self.interned.insert(key, index);
        index
    }

    pub fn utf8(&mut self, value: &str) -> u16 {
        let mut payload = vec![];
        payload.write_u16::<BigEndian>(value.len() as u16).unwrap();
        payload.extend_from_slice(value.as_bytes());
        self.constant(TAG_UTF8, payload)
    }

    pub fn integer(&mut self, value: i32) -> u16 {
        self.constant(TAG_INTEGER, value.to_be_bytes().to_vec())
    }

    pub fn class(&mut self, name: &str) -> u16 {
        let name = self.utf8(name);
        self.constant(TAG_CLASS, name.to_be_bytes().to_vec())
    }

    pub fn string(&mut self, value: &str) -> u16 {
        let value = self.utf8(value);
        self.constant(TAG_STRING, value.to_be_bytes().to_vec())
    }

    fn member_ref(&mut self, tag: u8, class: &str, name: &str, descriptor: &str) -> u16 {
        let class = self.class(class);
        let name = self.utf8(name);
        let descriptor = self.utf8(descriptor);
        let mut name_and_type = name.to_be_bytes().to_vec();
        name_and_type.extend_from_slice(&descriptor.to_be_bytes());
        let name_and_type = self.constant(TAG_NAME_AND_TYPE, name_and_type);
        let mut payload = class.to_be_bytes().to_vec();
        payload.extend_from_slice(&name_and_type.to_be_bytes());
        self.constant(tag, payload)
    }

    pub fn field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.member_ref(TAG_FIELDREF, class, name, descriptor)
    }

    pub fn method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.member_ref(TAG_METHODREF, class, name, descriptor)
    }

    pub fn source_file(&mut self, name: &str) -> &mut ClassFileBuilder {
        self.source_file = Some(self.utf8(name));
        self
    }

    pub fn field(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
    ) -> &mut ClassFileBuilder {
        let mut out = vec![];
        let name = self.utf8(name);
        let descriptor = self.utf8(descriptor);
        for value in [access_flags, name, descriptor, 0] {
            out.write_u16::<BigEndian>(value).unwrap();
        }
        self.fields.push(out);
        self
    }

    pub fn method(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        code: Code,
    ) -> &mut ClassFileBuilder {
        let name = self.utf8(name);
        let descriptor = self.utf8(descriptor);
        let code_name = self.utf8("Code");

        let mut attributes: Vec<(u16, Vec<u8>)> = vec![];
        if let Some(stack_map) = code.stack_map {
            attributes.push((self.utf8("StackMap"), stack_map));
        }
        if !code.line_numbers.is_empty() {
            let mut table = vec![];
            table.write_u16::<BigEndian>(code.line_numbers.len() as u16).unwrap();
            for (start_pc, line) in &code.line_numbers {
                table.write_u16::<BigEndian>(*start_pc).unwrap();
                table.write_u16::<BigEndian>(*line).unwrap();
            }
            attributes.push((self.utf8("LineNumberTable"), table));
        }

        let mut body = vec![];
        body.write_u16::<BigEndian>(code.max_stack).unwrap();
        body.write_u16::<BigEndian>(code.max_locals).unwrap();
        body.write_u32::<BigEndian>(code.code.len() as u32).unwrap();
        body.extend_from_slice(&code.code);
        body.write_u16::<BigEndian>(code.handlers.len() as u16).unwrap();
        for (start_pc, end_pc, handler_pc, catch_type) in &code.handlers {
            for value in [start_pc, end_pc, handler_pc, catch_type] {
                body.write_u16::<BigEndian>(*value).unwrap();
            }
        }
        write_attributes(&mut body, &attributes);

        let mut out = vec![];
        for value in [access_flags, name, descriptor] {
            out.write_u16::<BigEndian>(value).unwrap();
        }
        write_attributes(&mut out, &[(code_name, body)]);
        self.methods.push(out);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = vec![];
        out.write_u32::<BigEndian>(0xCAFE_BABE).unwrap();
        out.write_u16::<BigEndian>(3).unwrap();
        out.write_u16::<BigEndian>(45).unwrap();
        out.write_u16::<BigEndian>(self.constant_count).unwrap();
        out.extend_from_slice(&self.constants);
        for value in [self.access_flags, self.this_class, self.super_class, 0] {
            out.write_u16::<BigEndian>(value).unwrap();
        }
        for members in [&self.fields, &self.methods] {
            out.write_u16::<BigEndian>(members.len() as u16).unwrap();
            for member in members {
                out.extend_from_slice(member);
            }
        }
        let attributes: Vec<(u16, Vec<u8>)> = match self.source_file {
            Some(source_file) => {
                // The name is interned by `source_file`, so this lookup never adds a constant
                let name = self.interned[&(TAG_UTF8, utf8_payload("SourceFile"))];
                vec![(name, source_file.to_be_bytes().to_vec())]
            }
            None => vec![],
        };
        write_attributes(&mut out, &attributes);
        out
    }
}

fn utf8_payload(value: &str) -> Vec<u8> {
    let mut payload = (value.len() as u16).to_be_bytes().to_vec();
    payload.extend_from_slice(value.as_bytes());
    payload
}

fn write_attributes(out: &mut Vec<u8>, attributes: &[(u16, Vec<u8>)]) {
    out.write_u16::<BigEndian>(attributes.len() as u16).unwrap();
    for (name, body) in attributes {
        out.write_u16::<BigEndian>(*name).unwrap();
        out.write_u32::<BigEndian>(body.len() as u32).unwrap();
        out.extend_from_slice(body);
    }
}
