//! Binary module format: the on-disk/over-the-wire encoding of a
//! [`super::Module`] (§4.3.4).
//!
//! Layout: version byte; var-int-length string table; var-int shape
//! table; var-int function count, then per function: fixed header bytes,
//! instruction words, constant pool, child list, and optional debug
//! tables; finally the main function id.

use super::builder::{Module, ShapeTable};
use super::constant::{Constant, ConstantTag, ImportPath, Shape, StringTable};
use super::instruction::Instruction;
use super::proto::{CaptureType, DebugLocal, DebugUpvalue, FunctionProto, LineInfo};
use crate::error::{DecodeError, DecodeResult};
use std::rc::Rc;

/// Current format version (§4.3.4 "version byte defines the codec
/// family").
pub const FORMAT_VERSION: u8 = 1;

/// Serialize `module` to its binary module representation.
pub fn write_module(module: &Module) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(FORMAT_VERSION);

    write_varint(&mut out, module.strings.len() as u64);
    for s in module.strings.iter() {
        write_bytes(&mut out, s.as_bytes());
    }

    write_varint(&mut out, module.shapes.len() as u64);
    for shape in module.shapes.iter() {
        write_varint(&mut out, shape.keys.len() as u64);
        for &k in &shape.keys {
            write_varint(&mut out, k as u64);
        }
    }

    write_varint(&mut out, module.functions.len() as u64);
    for proto in &module.functions {
        write_function(&mut out, proto);
    }

    write_varint(&mut out, module.main_function_id as u64);
    out
}

fn write_function(out: &mut Vec<u8>, proto: &FunctionProto) {
    out.push(proto.num_params);
    out.push(proto.is_vararg as u8);
    out.push(proto.num_upvalues);
    out.push(proto.max_stack_size);

    write_varint(out, proto.capture_types.len() as u64);
    for ct in &proto.capture_types {
        out.push(capture_tag(*ct));
    }

    write_varint(out, proto.code.len() as u64);
    for instr in &proto.code {
        out.extend_from_slice(&instr.raw().to_le_bytes());
    }

    write_varint(out, proto.constants.len() as u64);
    for c in proto.constants.iter() {
        write_constant(out, c);
    }

    write_varint(out, proto.children.len() as u64);
    for &child in &proto.children {
        write_varint(out, child as u64);
    }

    match &proto.debug_name {
        Some(name) => {
            out.push(1);
            write_bytes(out, name.as_bytes());
        }
        None => out.push(0),
    }

    if proto.line_info.deltas.is_empty() {
        out.push(0);
    } else {
        out.push(1);
        out.push(proto.line_info.span_log2);
        write_varint(out, proto.line_info.baselines.len() as u64);
        for &b in &proto.line_info.baselines {
            write_varint(out, b as u64);
        }
        write_varint(out, proto.line_info.deltas.len() as u64);
        out.extend_from_slice(&proto.line_info.deltas);
    }

    if proto.debug_locals.is_empty() {
        out.push(0);
    } else {
        out.push(1);
        write_varint(out, proto.debug_locals.len() as u64);
        for local in &proto.debug_locals {
            write_bytes(out, local.name.as_bytes());
            out.push(local.register);
            write_varint(out, local.begin_pc as u64);
            write_varint(out, local.end_pc as u64);
        }
    }

    if proto.debug_upvalues.is_empty() {
        out.push(0);
    } else {
        out.push(1);
        write_varint(out, proto.debug_upvalues.len() as u64);
        for up in &proto.debug_upvalues {
            write_bytes(out, up.name.as_bytes());
        }
    }
}

fn write_constant(out: &mut Vec<u8>, c: &Constant) {
    out.push(c.tag() as u8);
    match c {
        Constant::Null => {}
        Constant::Bool(b) => out.push(*b as u8),
        Constant::Number(bits) => out.extend_from_slice(&bits.to_le_bytes()),
        Constant::Str(idx) => write_varint(out, *idx as u64),
        Constant::Import(path) => {
            write_varint(out, path.segments.len() as u64);
            for &seg in &path.segments {
                write_varint(out, seg as u64);
            }
        }
        Constant::Table(idx) => write_varint(out, *idx as u64),
        Constant::Closure(idx) => write_varint(out, *idx as u64),
    }
}

fn capture_tag(ct: CaptureType) -> u8 {
    match ct {
        CaptureType::Value => 0,
        CaptureType::Reference => 1,
        CaptureType::Upvalue => 2,
    }
}

fn capture_from_tag(tag: u8, offset: usize) -> DecodeResult<CaptureType> {
    match tag {
        0 => Ok(CaptureType::Value),
        1 => Ok(CaptureType::Reference),
        2 => Ok(CaptureType::Upvalue),
        _ => Err(DecodeError::InvalidTag { tag, offset }),
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// A cursor over an in-memory byte slice, tracking position for error
/// offsets (§4.3.4).
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> DecodeResult<u8> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or(DecodeError::UnexpectedEof { offset: self.pos })?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u32_le(&mut self) -> DecodeResult<u32> {
        if self.pos + 4 > self.bytes.len() {
            return Err(DecodeError::UnexpectedEof { offset: self.pos });
        }
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.bytes[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_le(&mut self) -> DecodeResult<u64> {
        if self.pos + 8 > self.bytes.len() {
            return Err(DecodeError::UnexpectedEof { offset: self.pos });
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.bytes[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_varint(&mut self) -> DecodeResult<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            if shift >= 64 {
                return Err(DecodeError::OutOfRange { offset: self.pos });
            }
            let byte = self.read_u8()?;
            result |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    fn read_bytes(&mut self, len: usize) -> DecodeResult<&'a [u8]> {
        if self.pos + len > self.bytes.len() {
            return Err(DecodeError::UnexpectedEof { offset: self.pos });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_string(&mut self) -> DecodeResult<String> {
        let len = self.read_varint()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Decode a [`Module`] from its binary module representation.
pub fn read_module(bytes: &[u8]) -> DecodeResult<Module> {
    let mut r = Reader::new(bytes);

    let version = r.read_u8()?;
    if version != FORMAT_VERSION {
        return Err(DecodeError::UnsupportedVersion {
            version,
            offset: 0,
        });
    }

    let mut strings = StringTable::new();
    let string_count = r.read_varint()? as usize;
    for _ in 0..string_count {
        let s = r.read_string()?;
        strings.intern(&s);
    }

    let mut shapes = ShapeTable::default();
    let shape_count = r.read_varint()? as usize;
    for _ in 0..shape_count {
        let key_count = r.read_varint()? as usize;
        let mut keys = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            keys.push(r.read_varint()? as u32);
        }
        shapes.intern(Shape { keys });
    }

    let function_count = r.read_varint()? as usize;
    let mut functions = Vec::with_capacity(function_count);
    for _ in 0..function_count {
        functions.push(read_function(&mut r)?);
    }

    let main_function_id = r.read_varint()? as u32;

    Ok(Module {
        functions,
        strings,
        shapes,
        main_function_id,
    })
}

fn read_function(r: &mut Reader) -> DecodeResult<FunctionProto> {
    let num_params = r.read_u8()?;
    let is_vararg = r.read_u8()? != 0;
    let num_upvalues = r.read_u8()?;
    let max_stack_size = r.read_u8()?;

    let capture_count = r.read_varint()? as usize;
    let mut capture_types = Vec::with_capacity(capture_count);
    for _ in 0..capture_count {
        let offset = r.pos;
        let tag = r.read_u8()?;
        capture_types.push(capture_from_tag(tag, offset)?);
    }

    let code_len = r.read_varint()? as usize;
    let mut code = Vec::with_capacity(code_len);
    for _ in 0..code_len {
        code.push(Instruction::from_raw(r.read_u32_le()?));
    }

    let constant_count = r.read_varint()? as usize;
    let mut constants = super::constant::ConstantPool::new();
    for _ in 0..constant_count {
        constants.insert(read_constant(r)?);
    }

    let child_count = r.read_varint()? as usize;
    let mut children = Vec::with_capacity(child_count);
    for _ in 0..child_count {
        children.push(r.read_varint()? as u32);
    }

    let debug_name = if r.read_u8()? != 0 {
        Some(Rc::from(r.read_string()?.as_str()))
    } else {
        None
    };

    let line_info = if r.read_u8()? != 0 {
        let span_log2 = r.read_u8()?;
        let baseline_count = r.read_varint()? as usize;
        let mut baselines = Vec::with_capacity(baseline_count);
        for _ in 0..baseline_count {
            baselines.push(r.read_varint()? as u32);
        }
        let delta_count = r.read_varint()? as usize;
        let deltas = r.read_bytes(delta_count)?.to_vec();
        LineInfo {
            span_log2,
            deltas,
            baselines,
        }
    } else {
        LineInfo::default()
    };

    let debug_locals = if r.read_u8()? != 0 {
        let count = r.read_varint()? as usize;
        let mut locals = Vec::with_capacity(count);
        for _ in 0..count {
            let name = r.read_string()?;
            let register = r.read_u8()?;
            let begin_pc = r.read_varint()? as u32;
            let end_pc = r.read_varint()? as u32;
            locals.push(DebugLocal {
                name: Rc::from(name.as_str()),
                register,
                begin_pc,
                end_pc,
            });
        }
        locals
    } else {
        Vec::new()
    };

    let debug_upvalues = if r.read_u8()? != 0 {
        let count = r.read_varint()? as usize;
        let mut ups = Vec::with_capacity(count);
        for _ in 0..count {
            ups.push(DebugUpvalue {
                name: Rc::from(r.read_string()?.as_str()),
            });
        }
        ups
    } else {
        Vec::new()
    };

    Ok(FunctionProto {
        code,
        constants,
        children,
        line_info,
        debug_locals,
        debug_upvalues,
        debug_name,
        num_params,
        is_vararg,
        num_upvalues,
        max_stack_size,
        capture_types,
    })
}

fn read_constant(r: &mut Reader) -> DecodeResult<Constant> {
    let offset = r.pos;
    let tag_byte = r.read_u8()?;
    let tag = match tag_byte {
        0 => ConstantTag::Null,
        1 => ConstantTag::Bool,
        2 => ConstantTag::Number,
        3 => ConstantTag::Str,
        4 => ConstantTag::Import,
        5 => ConstantTag::Table,
        6 => ConstantTag::Closure,
        _ => return Err(DecodeError::InvalidTag { tag: tag_byte, offset }),
    };
    Ok(match tag {
        ConstantTag::Null => Constant::Null,
        ConstantTag::Bool => Constant::Bool(r.read_u8()? != 0),
        ConstantTag::Number => Constant::Number(r.read_u64_le()?),
        ConstantTag::Str => Constant::Str(r.read_varint()? as u32),
        ConstantTag::Import => {
            let count = r.read_varint()? as usize;
            let mut segments = Vec::with_capacity(count);
            for _ in 0..count {
                segments.push(r.read_varint()? as u32);
            }
            Constant::Import(ImportPath { segments })
        }
        ConstantTag::Table => Constant::Table(r.read_varint()? as u32),
        ConstantTag::Closure => Constant::Closure(r.read_varint()? as u32),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Builder, Opcode};

    #[test]
    fn round_trips_a_minimal_module() {
        let mut b = Builder::new();
        b.begin_function(0, false);
        let k = b.add_constant_number(42.0).unwrap();
        b.emit_ad(Opcode::LoadNumber, 0, k as i16);
        b.emit_abc(Opcode::CallReturn, 0, 1, 0);
        let main = b.end_function(1, 0).unwrap();
        b.set_main_function(main);
        let module = b.finish();

        let bytes = write_module(&module);
        let decoded = read_module(&bytes).expect("round trip decode");

        assert_eq!(decoded.main_function_id, main);
        assert_eq!(decoded.functions.len(), 1);
        assert_eq!(decoded.functions[0].code.len(), module.functions[0].code.len());
        assert_eq!(
            decoded.functions[0].constants.get(0).unwrap().as_number(),
            Some(42.0)
        );
    }

    #[test]
    fn rejects_unsupported_version() {
        let bytes = vec![99u8, 0, 0, 0, 0];
        let err = read_module(&bytes).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedVersion { version: 99, .. }));
    }
}
