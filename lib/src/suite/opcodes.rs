//! Byte values of the suite instruction set
//!
//! The immediate forms come in runs of sixteen (`CONST_0` is followed by `CONST_1`, and so on up
//! to `CONST_15`). Long and floating point instructions live in their own tables, behind the
//! `LONGOP` and `FLOATOP` escapes.

use super::emitter::{BranchOp, FieldOp, NumericInsn, NumericOp, NumericPrefix, SimpleOp};
use crate::ir::{ArithmeticOp, Condition, InvokeForm};
use crate::model::PrimitiveType;

pub const CONST_0: u8 = 0;
pub const OBJECT_0: u8 = 16;
pub const CLASS_0: u8 = 32;
pub const LOAD_0: u8 = 48;
pub const STORE_0: u8 = 64;

/// Supplies bits 8 to 11 of the operand of the instruction that follows
pub const WIDE_0: u8 = 80;
pub const WIDE_HALF: u8 = 96;
pub const WIDE_INT: u8 = 97;

pub const CONST_M1: u8 = 98;
pub const CONST_NULL: u8 = 99;
pub const CONST_BYTE: u8 = 100;
pub const CONST_SHORT: u8 = 101;
pub const CONST_CHAR: u8 = 102;
pub const CONST_INT: u8 = 103;
pub const CONST_LONG: u8 = 104;
pub const CONST_FLOAT: u8 = 105;
pub const CONST_DOUBLE: u8 = 106;

pub const OBJECT: u8 = 107;
pub const CLASS: u8 = 108;
pub const LOAD: u8 = 109;
pub const STORE: u8 = 110;
pub const INC: u8 = 111;
pub const DEC: u8 = 112;

pub const LONGOP: u8 = 113;
pub const FLOATOP: u8 = 114;

pub const IADD: u8 = 115;
pub const NEG: u8 = 126;
pub const I2B: u8 = 127;
pub const I2S: u8 = 128;
pub const I2C: u8 = 129;

pub const GOTO: u8 = 130;
pub const IFEQ: u8 = 131;
pub const IF_ICMPEQ: u8 = 137;
pub const TABLESWITCH: u8 = 143;
pub const LOOKUP: u8 = 144;

pub const GETFIELD: u8 = 145;
pub const PUTFIELD: u8 = 146;
pub const THIS_GETFIELD: u8 = 147;
pub const THIS_PUTFIELD: u8 = 148;
pub const GETSTATIC: u8 = 149;
pub const PUTSTATIC: u8 = 150;
pub const CLASS_GETSTATIC: u8 = 151;
pub const CLASS_PUTSTATIC: u8 = 152;

pub const INVOKEVIRTUAL: u8 = 153;
pub const INVOKESUPER: u8 = 154;
pub const INVOKESTATIC: u8 = 155;
pub const INVOKEINIT: u8 = 156;
pub const INVOKEINTERFACE: u8 = 157;

pub const ALOAD: u8 = 158;
pub const ASTORE: u8 = 159;
pub const ARRAYLENGTH: u8 = 160;
pub const NEWARRAY: u8 = 161;
pub const NEWDIMENSION: u8 = 162;
pub const CLINIT: u8 = 163;
pub const CHECKCAST: u8 = 164;
pub const INSTANCEOF: u8 = 165;
pub const MONITORENTER: u8 = 166;
pub const MONITOREXIT: u8 = 167;
pub const CLASS_MONITORENTER: u8 = 168;
pub const CLASS_MONITOREXIT: u8 = 169;
pub const POP: u8 = 170;
pub const RETURN: u8 = 171;
pub const THROW: u8 = 172;

// Behind `LONGOP`
pub const LADD: u8 = 0;
pub const LCMP: u8 = 11;
pub const LNEG: u8 = 12;
pub const I2L: u8 = 13;
pub const L2I: u8 = 14;

// Behind `FLOATOP`
pub const FADD: u8 = 0;
pub const DADD: u8 = 5;
pub const FCMPL: u8 = 10;
pub const FCMPG: u8 = 11;
pub const DCMPL: u8 = 12;
pub const DCMPG: u8 = 13;
pub const FNEG: u8 = 14;
pub const DNEG: u8 = 15;
pub const I2F: u8 = 16;
pub const L2F: u8 = 17;
pub const D2F: u8 = 18;
pub const I2D: u8 = 19;
pub const L2D: u8 = 20;
pub const F2D: u8 = 21;
pub const F2I: u8 = 22;
pub const F2L: u8 = 23;
pub const D2I: u8 = 24;
pub const D2L: u8 = 25;

/// Position of an operator within a run of arithmetic opcodes
fn arithmetic_offset(op: ArithmeticOp) -> Option<u8> {
    Some(match op {
        ArithmeticOp::Add => 0,
        ArithmeticOp::Sub => 1,
        ArithmeticOp::Mul => 2,
        ArithmeticOp::Div => 3,
        ArithmeticOp::Rem => 4,
        ArithmeticOp::Shl => 5,
        ArithmeticOp::Shr => 6,
        ArithmeticOp::Ushr => 7,
        ArithmeticOp::And => 8,
        ArithmeticOp::Or => 9,
        ArithmeticOp::Xor => 10,
        ArithmeticOp::Cmp | ArithmeticOp::CmpL | ArithmeticOp::CmpG => return None,
    })
}

fn condition_offset(condition: Condition) -> u8 {
    match condition {
        Condition::Eq => 0,
        Condition::Ne => 1,
        Condition::Lt => 2,
        Condition::Ge => 3,
        Condition::Gt => 4,
        Condition::Le => 5,
    }
}

/// Escape prefix (if any) and opcode of an arithmetic, negation or conversion
pub fn numeric(insn: NumericInsn) -> Option<(Option<u8>, u8)> {
    use PrimitiveType::*;
    let opcode = match (insn.prefix, insn.op, insn.operand) {
        (None, NumericOp::Arithmetic(op), Int) => IADD + arithmetic_offset(op)?,
        (None, NumericOp::Negate, Int) => NEG,
        (None, NumericOp::Convert(Byte), Int) => I2B,
        (None, NumericOp::Convert(Short), Int) => I2S,
        (None, NumericOp::Convert(Char), Int) => I2C,

        (Some(NumericPrefix::Long), NumericOp::Arithmetic(ArithmeticOp::Cmp), Long) => LCMP,
        (Some(NumericPrefix::Long), NumericOp::Arithmetic(op), Long) => {
            LADD + arithmetic_offset(op)?
        }
        (Some(NumericPrefix::Long), NumericOp::Negate, Long) => LNEG,
        (Some(NumericPrefix::Long), NumericOp::Convert(Long), Int) => I2L,
        (Some(NumericPrefix::Long), NumericOp::Convert(Int), Long) => L2I,

        (Some(NumericPrefix::Float), NumericOp::Arithmetic(op), operand @ (Float | Double)) => {
            let base = if operand == Float { FADD } else { DADD };
            match op {
                ArithmeticOp::CmpL if operand == Float => FCMPL,
                ArithmeticOp::CmpG if operand == Float => FCMPG,
                ArithmeticOp::CmpL => DCMPL,
                ArithmeticOp::CmpG => DCMPG,
                ArithmeticOp::Add
                | ArithmeticOp::Sub
                | ArithmeticOp::Mul
                | ArithmeticOp::Div
                | ArithmeticOp::Rem => base + arithmetic_offset(op)?,
                _ => return None,
            }
        }
        (Some(NumericPrefix::Float), NumericOp::Negate, Float) => FNEG,
        (Some(NumericPrefix::Float), NumericOp::Negate, Double) => DNEG,
        (Some(NumericPrefix::Float), NumericOp::Convert(to), from) => match (from, to) {
            (Int, Float) => I2F,
            (Long, Float) => L2F,
            (Double, Float) => D2F,
            (Int, Double) => I2D,
            (Long, Double) => L2D,
            (Float, Double) => F2D,
            (Float, Int) => F2I,
            (Float, Long) => F2L,
            (Double, Int) => D2I,
            (Double, Long) => D2L,
            _ => return None,
        },
        _ => return None,
    };
    let prefix = insn.prefix.map(|prefix| match prefix {
        NumericPrefix::Long => LONGOP,
        NumericPrefix::Float => FLOATOP,
    });
    Some((prefix, opcode))
}

pub fn branch(op: BranchOp) -> u8 {
    match op {
        BranchOp::Goto => GOTO,
        BranchOp::If {
            condition,
            with_zero: true,
        } => IFEQ + condition_offset(condition),
        BranchOp::If { condition, .. } => IF_ICMPEQ + condition_offset(condition),
    }
}

pub fn field(op: FieldOp) -> u8 {
    match op {
        FieldOp::GetField => GETFIELD,
        FieldOp::PutField => PUTFIELD,
        FieldOp::ThisGetField => THIS_GETFIELD,
        FieldOp::ThisPutField => THIS_PUTFIELD,
        FieldOp::GetStatic => GETSTATIC,
        FieldOp::PutStatic => PUTSTATIC,
        FieldOp::ClassGetStatic => CLASS_GETSTATIC,
        FieldOp::ClassPutStatic => CLASS_PUTSTATIC,
    }
}

pub fn invoke(form: InvokeForm) -> u8 {
    match form {
        InvokeForm::Virtual => INVOKEVIRTUAL,
        InvokeForm::Super => INVOKESUPER,
        InvokeForm::Static => INVOKESTATIC,
        InvokeForm::Init => INVOKEINIT,
        InvokeForm::Interface => INVOKEINTERFACE,
    }
}

pub fn simple(op: SimpleOp) -> u8 {
    match op {
        SimpleOp::ArrayLoad => ALOAD,
        SimpleOp::ArrayStore => ASTORE,
        SimpleOp::ArrayLength => ARRAYLENGTH,
        SimpleOp::NewArray => NEWARRAY,
        SimpleOp::NewDimension => NEWDIMENSION,
        SimpleOp::New => CLINIT,
        SimpleOp::CheckCast => CHECKCAST,
        SimpleOp::InstanceOf => INSTANCEOF,
        SimpleOp::Lookup => LOOKUP,
        SimpleOp::MonitorEnter => MONITORENTER,
        SimpleOp::MonitorExit => MONITOREXIT,
        SimpleOp::ClassMonitorEnter => CLASS_MONITORENTER,
        SimpleOp::ClassMonitorExit => CLASS_MONITOREXIT,
        SimpleOp::Pop => POP,
        SimpleOp::Return => RETURN,
        SimpleOp::Throw => THROW,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn runs_do_not_overlap() {
        assert_eq!(CONST_0 + 16, OBJECT_0);
        assert_eq!(STORE_0 + 16, WIDE_0);
        assert_eq!(WIDE_0 + 16, WIDE_HALF);
        assert_eq!(IADD + 11, NEG);
        assert_eq!(IFEQ + 6, IF_ICMPEQ);
        assert_eq!(IF_ICMPEQ + 6, TABLESWITCH);
        assert_eq!(LADD + 11, LCMP);
        assert_eq!(DADD + 5, FCMPL);
    }

    #[test]
    fn numeric_encodings() {
        let long_shift = NumericInsn {
            op: NumericOp::Arithmetic(ArithmeticOp::Shl),
            operand: PrimitiveType::Long,
            prefix: Some(NumericPrefix::Long),
        };
        assert_eq!(numeric(long_shift), Some((Some(LONGOP), LADD + 5)));

        let double_compare = NumericInsn {
            op: NumericOp::Arithmetic(ArithmeticOp::CmpG),
            operand: PrimitiveType::Double,
            prefix: Some(NumericPrefix::Float),
        };
        assert_eq!(numeric(double_compare), Some((Some(FLOATOP), DCMPG)));

        let float_shift = NumericInsn {
            op: NumericOp::Arithmetic(ArithmeticOp::Shl),
            operand: PrimitiveType::Float,
            prefix: Some(NumericPrefix::Float),
        };
        assert_eq!(numeric(float_shift), None);
    }
}
