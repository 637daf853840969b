//! End-to-end scenarios: build a tiny module by hand, compile it, and call the resulting
//! native code through a raw function pointer. Exercises the full pipeline (allocator,
//! encoder, ABI, finalization) rather than any single component in isolation.
//!
//! Every test here transmutes a freshly generated buffer into an `extern "C" fn` and calls
//! it directly, so the whole file is gated to the one host that can actually run AArch64
//! machine code; on any other target these scenarios would need to cross-compile and run
//! under an emulator instead; see the `disas-check` feature for an off-target alternative
//! that verifies encodings without executing them.
#![cfg(target_arch = "aarch64")]

use hl_aarch64_jit::module::{FunctionIndex, FunctionType, Module, Op, Type, TypeIndex, TypeKind, VReg, VRegIndex};
use hl_aarch64_jit::runtime::{DynKind, Runtime};
use hl_aarch64_jit::{Flags, JitContext};

/// A runtime stand-in with plausible but arbitrary object layouts, enough to drive the
/// allocation/field-access scenarios below without a real VM behind it.
struct FakeRuntime;

const OBJ_FIELD_STRIDE: u32 = 8;
const OBJ_HEADER_SIZE: u32 = 16;

impl Runtime for FakeRuntime {
    fn alloc_obj_addr(&self) -> usize {
        fake_alloc_obj as usize
    }
    fn alloc_dynobj_addr(&self) -> usize {
        fake_alloc_obj as usize
    }
    fn alloc_virtual_addr(&self) -> usize {
        fake_alloc_obj as usize
    }
    fn alloc_enum_addr(&self) -> usize {
        fake_alloc_obj as usize
    }
    fn alloc_dynamic_addr(&self) -> usize {
        fake_alloc_obj as usize
    }
    fn alloc_dynbool_addr(&self) -> usize {
        fake_alloc_obj as usize
    }

    fn dyn_cast_addr(&self, _kind: DynKind) -> usize {
        unimplemented!("not exercised by these scenarios")
    }
    fn dyn_get_addr(&self, _kind: DynKind) -> usize {
        unimplemented!("not exercised by these scenarios")
    }
    fn dyn_set_addr(&self, _kind: DynKind) -> usize {
        unimplemented!("not exercised by these scenarios")
    }

    fn null_access_addr(&self) -> usize {
        fake_null_access as usize
    }
    fn to_virtual_addr(&self) -> usize {
        unimplemented!("not exercised by these scenarios")
    }

    fn throw_addr(&self) -> usize {
        fake_null_access as usize
    }
    fn rethrow_addr(&self) -> usize {
        fake_null_access as usize
    }
    fn trap_push_addr(&self) -> usize {
        fake_null_access as usize
    }
    fn trap_pop_addr(&self) -> usize {
        fake_null_access as usize
    }
    fn assert_fail_addr(&self) -> usize {
        fake_null_access as usize
    }

    fn alloc_executable_memory(&self, _size: usize) -> Option<(*mut u8, usize)> {
        None
    }

    fn obj_field_offset(&self, _ty: &Type, field_index: u32) -> u32 {
        OBJ_HEADER_SIZE + field_index * OBJ_FIELD_STRIDE
    }
    fn virtual_field_slot_offset(&self, _ty: &Type, field_index: u32) -> u32 {
        OBJ_HEADER_SIZE + field_index * OBJ_FIELD_STRIDE
    }
    fn enum_field_offset(&self, _ty: &Type, _construct: u32, field_index: u32) -> u32 {
        OBJ_HEADER_SIZE + field_index * OBJ_FIELD_STRIDE
    }
    fn enum_index_offset(&self) -> u32 {
        8
    }
    fn type_kind_offset(&self) -> u32 {
        0
    }
    fn array_header_size(&self) -> u32 {
        16
    }
    fn array_size_offset(&self) -> u32 {
        8
    }
    fn array_elem_size(&self, elem_ty: &Type) -> u32 {
        elem_ty.kind.size()
    }
    fn closure_fn_ptr_offset(&self) -> u32 {
        0
    }
    fn closure_has_value_offset(&self) -> u32 {
        8
    }
    fn closure_value_offset(&self) -> u32 {
        16
    }
    fn dynamic_payload_offset(&self) -> u32 {
        8
    }
    fn type_size(&self, ty: &Type) -> u32 {
        ty.kind.size()
    }
    fn hash_utf8(&self, s: &str) -> u32 {
        s.bytes().fold(5381u32, |h, b| h.wrapping_mul(33).wrapping_add(b as u32))
    }
    fn invalidate_icache(&self, _ptr: *const u8, _len: usize) {
        #[cfg(target_os = "macos")]
        unsafe {
            extern "C" {
                fn sys_icache_invalidate(start: *mut std::ffi::c_void, len: usize);
            }
            sys_icache_invalidate(_ptr as *mut std::ffi::c_void, _len);
        }
    }
}

extern "C" fn fake_alloc_obj(_ty: usize) -> usize {
    let storage = vec![0u64; 8].into_boxed_slice();
    Box::into_raw(storage) as *mut u64 as usize
}

extern "C" fn fake_null_access() -> ! {
    panic!("null access trapped in compiled code")
}

fn i64_ty() -> Type {
    Type { kind: TypeKind::I64, addr: 0 }
}

fn obj_ty() -> Type {
    Type { kind: TypeKind::Obj, addr: 0x1000 }
}

fn void_ty() -> Type {
    Type { kind: TypeKind::Void, addr: 0 }
}

fn f64_ty() -> Type {
    Type { kind: TypeKind::F64, addr: 0 }
}

fn compile_single_function(module: &mut Module) -> extern "C" fn() {
    let mut ctx = JitContext::new(Flags::for_tests());
    ctx.init(module);
    let runtime = FakeRuntime;
    for i in 0..module.functions.len() {
        let func = module.functions[i].clone();
        let offset = ctx.compile_function(module, &func, &runtime);
        module.function_addrs[i] = Some(offset);
    }
    let finalized = ctx.finalize(module, &runtime, None).expect("finalize should succeed");
    let base = finalized.memory.as_ptr() as usize;
    let entry = base + module.function_addrs[0].unwrap();
    // Leak the mapping for the duration of the test process; dropping it would unmap code
    // the returned function pointer still points into.
    std::mem::forget(finalized.memory);
    unsafe { std::mem::transmute::<usize, extern "C" fn()>(entry) }
}

#[test]
fn identity_on_int() {
    let mut module = Module {
        types: vec![i64_ty()],
        ..Default::default()
    };
    let func = hl_aarch64_jit::module::Function {
        index: FunctionIndex(0),
        ty: FunctionType { args: vec![TypeIndex(0)], ret: TypeIndex(0) },
        vregs: vec![VReg { ty: TypeIndex(0) }],
        ops: vec![Op::Ret { src: VRegIndex(0) }],
    };
    module.functions.push(func);
    module.function_addrs.push(None);

    let entry = compile_single_function(&mut module);
    let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(entry) };
    assert_eq!(f(42), 42);
}

#[test]
fn add_two_ints() {
    let mut module = Module {
        types: vec![i64_ty()],
        ..Default::default()
    };
    let func = hl_aarch64_jit::module::Function {
        index: FunctionIndex(0),
        ty: FunctionType { args: vec![TypeIndex(0), TypeIndex(0)], ret: TypeIndex(0) },
        vregs: vec![VReg { ty: TypeIndex(0) }, VReg { ty: TypeIndex(0) }, VReg { ty: TypeIndex(0) }],
        ops: vec![
            Op::Add { dst: VRegIndex(2), a: VRegIndex(0), b: VRegIndex(1) },
            Op::Ret { src: VRegIndex(2) },
        ],
    };
    module.functions.push(func);
    module.function_addrs.push(None);

    let entry = compile_single_function(&mut module);
    let f: extern "C" fn(i64, i64) -> i64 = unsafe { std::mem::transmute(entry) };
    assert_eq!(f(7, 35), 42);
}

#[test]
fn conditional_branch() {
    let mut module = Module {
        types: vec![i64_ty()],
        ints: vec![0, 1],
        ..Default::default()
    };
    let func = hl_aarch64_jit::module::Function {
        index: FunctionIndex(0),
        ty: FunctionType { args: vec![TypeIndex(0), TypeIndex(0)], ret: TypeIndex(0) },
        vregs: vec![VReg { ty: TypeIndex(0) }, VReg { ty: TypeIndex(0) }, VReg { ty: TypeIndex(0) }],
        ops: vec![
            // a < b ? jump to the else branch (offsets counted from the opcode after this one)
            Op::JSLt { a: VRegIndex(0), b: VRegIndex(1), offset: 2 },
            Op::Int { dst: VRegIndex(2), value: hl_aarch64_jit::module::ConstIndex(0) },
            Op::Ret { src: VRegIndex(2) },
            Op::Int { dst: VRegIndex(2), value: hl_aarch64_jit::module::ConstIndex(1) },
            Op::Ret { src: VRegIndex(2) },
        ],
    };
    module.functions.push(func);
    module.function_addrs.push(None);

    let entry = compile_single_function(&mut module);
    let f: extern "C" fn(i64, i64) -> i64 = unsafe { std::mem::transmute(entry) };
    assert_eq!(f(3, 5), 1);
    assert_eq!(f(5, 3), 0);
}

#[test]
fn self_recursive_factorial() {
    // fn fact(n): if n < 2 return 1; return n * fact(n - 1)
    let mut module = Module {
        types: vec![i64_ty()],
        ints: vec![1, 2],
        ..Default::default()
    };
    let func = hl_aarch64_jit::module::Function {
        index: FunctionIndex(0),
        ty: FunctionType { args: vec![TypeIndex(0)], ret: TypeIndex(0) },
        vregs: vec![
            VReg { ty: TypeIndex(0) }, // r0: n (arg)
            VReg { ty: TypeIndex(0) }, // r1: literal 2
            VReg { ty: TypeIndex(0) }, // r2: literal 1
            VReg { ty: TypeIndex(0) }, // r3: n - 1
            VReg { ty: TypeIndex(0) }, // r4: fact(n - 1)
            VReg { ty: TypeIndex(0) }, // r5: n * fact(n - 1)
        ],
        ops: vec![
            Op::Int { dst: VRegIndex(1), value: hl_aarch64_jit::module::ConstIndex(1) },
            Op::JSLt { a: VRegIndex(0), b: VRegIndex(1), offset: 2 },
            Op::Int { dst: VRegIndex(2), value: hl_aarch64_jit::module::ConstIndex(0) },
            Op::Ret { src: VRegIndex(2) },
            Op::Sub { dst: VRegIndex(3), a: VRegIndex(0), b: VRegIndex(2) },
            Op::Call1 { dst: VRegIndex(4), findex: FunctionIndex(0), arg0: VRegIndex(3) },
            Op::Mul { dst: VRegIndex(5), a: VRegIndex(0), b: VRegIndex(4) },
            Op::Ret { src: VRegIndex(5) },
        ],
    };
    module.functions.push(func);
    module.function_addrs.push(None);

    let entry = compile_single_function(&mut module);
    let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(entry) };
    assert_eq!(f(5), 120);
}

#[test]
fn object_field_round_trip() {
    let mut module = Module {
        types: vec![i64_ty(), obj_ty(), void_ty()],
        ints: vec![7],
        ..Default::default()
    };
    let func = hl_aarch64_jit::module::Function {
        index: FunctionIndex(0),
        ty: FunctionType { args: vec![], ret: TypeIndex(0) },
        vregs: vec![
            VReg { ty: TypeIndex(1) }, // r0: obj
            VReg { ty: TypeIndex(0) }, // r1: literal 7
            VReg { ty: TypeIndex(0) }, // r2: field read back
        ],
        ops: vec![
            Op::New { dst: VRegIndex(0) },
            Op::Int { dst: VRegIndex(1), value: hl_aarch64_jit::module::ConstIndex(0) },
            Op::SetField { obj: VRegIndex(0), field: 0, src: VRegIndex(1) },
            Op::Field { dst: VRegIndex(2), obj: VRegIndex(0), field: 0 },
            Op::Ret { src: VRegIndex(2) },
        ],
    };
    module.functions.push(func);
    module.function_addrs.push(None);

    let entry = compile_single_function(&mut module);
    let f: extern "C" fn() -> i64 = unsafe { std::mem::transmute(entry) };
    assert_eq!(f(), 7);
}

#[test]
fn float_divide() {
    let mut module = Module {
        types: vec![f64_ty()],
        floats: vec![1.0, 4.0],
        ..Default::default()
    };
    let func = hl_aarch64_jit::module::Function {
        index: FunctionIndex(0),
        ty: FunctionType { args: vec![], ret: TypeIndex(0) },
        vregs: vec![VReg { ty: TypeIndex(0) }, VReg { ty: TypeIndex(0) }, VReg { ty: TypeIndex(0) }],
        ops: vec![
            Op::Float { dst: VRegIndex(0), value: hl_aarch64_jit::module::ConstIndex(0) },
            Op::Float { dst: VRegIndex(1), value: hl_aarch64_jit::module::ConstIndex(1) },
            Op::SDiv { dst: VRegIndex(2), a: VRegIndex(0), b: VRegIndex(1) },
            Op::Ret { src: VRegIndex(2) },
        ],
    };
    module.functions.push(func);
    module.function_addrs.push(None);

    let entry = compile_single_function(&mut module);
    let f: extern "C" fn() -> f64 = unsafe { std::mem::transmute(entry) };
    assert_eq!(f(), 0.25);
}
