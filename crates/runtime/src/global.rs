//! Global instances.

use capstan_environ::ValType;

/// A global value. `val` holds every scalar; v128 globals use `val_hi`
/// for the upper half. Both words are read and written by generated code.
#[repr(C)]
pub struct GlobalInstance {
    val: u64,
    val_hi: u64,
    ty: ValType,
    mutable: bool,
}

impl GlobalInstance {
    pub fn new(ty: ValType, mutable: bool, val: u64, val_hi: u64) -> Box<GlobalInstance> {
        Box::new(GlobalInstance {
            val,
            val_hi,
            ty,
            mutable,
        })
    }

    pub fn ty(&self) -> ValType {
        self.ty
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub fn value(&self) -> u64 {
        match self.ty {
            ValType::I32 | ValType::F32 => self.val & 0xffff_ffff,
            _ => self.val,
        }
    }

    pub fn value_hi(&self) -> u64 {
        self.val_hi
    }

    pub fn set_value(&mut self, val: u64, val_hi: u64) {
        self.val = val;
        self.val_hi = val_hi;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_environ as env;
    use memoffset::offset_of;

    #[test]
    fn global_layout_matches_the_offset_table() {
        assert_eq!(
            offset_of!(GlobalInstance, val),
            env::GLOBAL_INSTANCE_VAL as usize
        );
        assert_eq!(
            offset_of!(GlobalInstance, val_hi),
            env::GLOBAL_INSTANCE_VAL_HI as usize
        );
    }
}
