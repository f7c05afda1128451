//! LLVM backend over `llvm-sys`, built with `--features llvm`.
//!
//! Every value is a `double`; string constants are rejected as soon as an
//! instruction tries to consume them. Execution goes through LLVM's
//! interpreter engine, so externs resolve against the host process.

use super::{ArithOp, Backend, Predicate, RunValue};
use crate::error::Error;
use libc::{c_char, c_uint};
use llvm_sys::analysis::{LLVMVerifierFailureAction, LLVMVerifyFunction};
use llvm_sys::execution_engine::{self, LLVMExecutionEngineRef};
use llvm_sys::prelude::*;
use llvm_sys::transforms::{instcombine, scalar};
use llvm_sys::{core, target, LLVMRealPredicate};
use std::ffi::{CStr, CString};
use std::ptr::null_mut;
use tracing::debug;

fn c_name(s: &str) -> CString {
    CString::new(s.replace('\0', "")).unwrap_or_default()
}

/// Copies and frees a message allocated by LLVM.
unsafe fn take_message(msg: *mut c_char) -> String {
    if msg.is_null() {
        return String::new();
    }
    let s = CStr::from_ptr(msg).to_string_lossy().into_owned();
    core::LLVMDisposeMessage(msg);
    s
}

pub struct LlvmBackend {
    context: LLVMContextRef,
    module: LLVMModuleRef,
    builder: LLVMBuilderRef,
    double_type: LLVMTypeRef,
    fpm: Option<LLVMPassManagerRef>,
    engine: LLVMExecutionEngineRef,
}

impl LlvmBackend {
    pub fn new(module_name: &str, optimize: bool) -> Result<Self, Error> {
        unsafe {
            target::LLVM_InitializeNativeTarget();
            execution_engine::LLVMLinkInInterpreter();

            let context = core::LLVMContextCreate();
            let name = c_name(module_name);
            let module = core::LLVMModuleCreateWithNameInContext(name.as_ptr(), context);
            let builder = core::LLVMCreateBuilderInContext(context);
            let double_type = core::LLVMDoubleTypeInContext(context);

            let fpm = if optimize {
                let fpm = core::LLVMCreateFunctionPassManagerForModule(module);
                instcombine::LLVMAddInstructionCombiningPass(fpm);
                scalar::LLVMAddReassociatePass(fpm);
                scalar::LLVMAddGVNPass(fpm);
                scalar::LLVMAddCFGSimplificationPass(fpm);
                core::LLVMInitializeFunctionPassManager(fpm);
                Some(fpm)
            } else {
                None
            };

            // The engine takes ownership of the module.
            let mut engine = null_mut();
            let mut err = null_mut();
            if execution_engine::LLVMCreateInterpreterForModule(&mut engine, module, &mut err) != 0
            {
                let msg = take_message(err);
                if let Some(fpm) = fpm {
                    core::LLVMDisposePassManager(fpm);
                }
                core::LLVMDisposeBuilder(builder);
                core::LLVMDisposeModule(module);
                core::LLVMContextDispose(context);
                return Err(Error::backend(format!("cannot create interpreter: {}", msg)));
            }

            Ok(LlvmBackend {
                context,
                module,
                builder,
                double_type,
                fpm,
                engine,
            })
        }
    }

    fn check_double(&self, v: LLVMValueRef) -> Result<(), Error> {
        if unsafe { core::LLVMTypeOf(v) } != self.double_type {
            return Err(Error::backend("only double values are supported by the LLVM backend"));
        }
        Ok(())
    }

    /// The block instructions are appended to, if it is still open.
    fn open_block(&self) -> Result<LLVMBasicBlockRef, Error> {
        let bb = unsafe { core::LLVMGetInsertBlock(self.builder) };
        if bb.is_null() {
            return Err(Error::backend("no insertion point"));
        }
        if !unsafe { core::LLVMGetBasicBlockTerminator(bb) }.is_null() {
            return Err(Error::backend("block is already terminated"));
        }
        Ok(bb)
    }
}

impl Drop for LlvmBackend {
    fn drop(&mut self) {
        unsafe {
            if let Some(fpm) = self.fpm.take() {
                core::LLVMDisposePassManager(fpm);
            }
            core::LLVMDisposeBuilder(self.builder);
            execution_engine::LLVMDisposeExecutionEngine(self.engine);
            core::LLVMContextDispose(self.context);
        }
    }
}

impl Backend for LlvmBackend {
    type Function = LLVMValueRef;
    type Block = LLVMBasicBlockRef;
    type Value = LLVMValueRef;

    fn declare_function(&mut self, name: &str, params: &[String]) -> LLVMValueRef {
        match self.lookup_function(name) {
            Some(f) => f,
            None => self.declare_replacement(name, params),
        }
    }

    fn lookup_function(&self, name: &str) -> Option<LLVMValueRef> {
        let cname = c_name(name);
        let f = unsafe { core::LLVMGetNamedFunction(self.module, cname.as_ptr()) };
        if f.is_null() {
            None
        } else {
            Some(f)
        }
    }

    fn param_count(&self, function: LLVMValueRef) -> usize {
        unsafe { core::LLVMCountParams(function) as usize }
    }

    fn param(&self, function: LLVMValueRef, index: usize) -> LLVMValueRef {
        unsafe { core::LLVMGetParam(function, index as c_uint) }
    }

    fn set_param_names(&mut self, function: LLVMValueRef, names: &[String]) {
        let count = self.param_count(function);
        for (i, name) in names.iter().enumerate().take(count) {
            let cname = c_name(name);
            unsafe { core::LLVMSetValueName(self.param(function, i), cname.as_ptr()) };
        }
    }

    fn has_body(&self, function: LLVMValueRef) -> bool {
        unsafe { core::LLVMCountBasicBlocks(function) > 0 }
    }

    fn erase_function(&mut self, function: LLVMValueRef) {
        debug!(?function, "erasing function");
        unsafe {
            let bb = core::LLVMGetInsertBlock(self.builder);
            if !bb.is_null() && core::LLVMGetBasicBlockParent(bb) == function {
                core::LLVMClearInsertionPosition(self.builder);
            }
            core::LLVMDeleteFunction(function);
        }
    }

    fn declare_replacement(&mut self, name: &str, params: &[String]) -> LLVMValueRef {
        // LLVM uniquifies the clashing name until `replace_function` runs.
        let cname = c_name(name);
        unsafe {
            let mut doubles = vec![self.double_type; params.len()];
            let ft = core::LLVMFunctionType(
                self.double_type,
                doubles.as_mut_ptr(),
                params.len() as c_uint,
                0,
            );
            let f = core::LLVMAddFunction(self.module, cname.as_ptr(), ft);
            self.set_param_names(f, params);
            f
        }
    }

    fn replace_function(&mut self, old: LLVMValueRef, new: LLVMValueRef) {
        debug!(?old, ?new, "replacing function");
        unsafe {
            let name = CStr::from_ptr(core::LLVMGetValueName(old)).to_owned();
            let old_ty = core::LLVMTypeOf(old);
            let replacement = if core::LLVMTypeOf(new) == old_ty {
                new
            } else {
                core::LLVMConstBitCast(new, old_ty)
            };
            core::LLVMReplaceAllUsesWith(old, replacement);
            self.erase_function(old);
            core::LLVMSetValueName(new, name.as_ptr());
        }
    }

    fn create_block(&mut self, function: LLVMValueRef, label: &str) -> LLVMBasicBlockRef {
        let cname = c_name(label);
        unsafe { core::LLVMAppendBasicBlockInContext(self.context, function, cname.as_ptr()) }
    }

    fn set_insertion_point(&mut self, block: LLVMBasicBlockRef) {
        unsafe { core::LLVMPositionBuilderAtEnd(self.builder, block) }
    }

    fn insertion_block(&self) -> Option<LLVMBasicBlockRef> {
        let bb = unsafe { core::LLVMGetInsertBlock(self.builder) };
        if bb.is_null() {
            None
        } else {
            Some(bb)
        }
    }

    fn const_float(&mut self, value: f64) -> LLVMValueRef {
        unsafe { core::LLVMConstReal(self.double_type, value) }
    }

    fn const_string(&mut self, value: &str) -> LLVMValueRef {
        unsafe {
            core::LLVMConstStringInContext(
                self.context,
                value.as_ptr() as *const c_char,
                value.len() as c_uint,
                0,
            )
        }
    }

    fn build_arith(
        &mut self,
        op: ArithOp,
        lhs: LLVMValueRef,
        rhs: LLVMValueRef,
        name: &str,
    ) -> Result<LLVMValueRef, Error> {
        self.open_block()?;
        self.check_double(lhs)?;
        self.check_double(rhs)?;
        let cname = c_name(name);
        let b = self.builder;
        let n = cname.as_ptr();
        Ok(unsafe {
            match op {
                ArithOp::FAdd => core::LLVMBuildFAdd(b, lhs, rhs, n),
                ArithOp::FSub => core::LLVMBuildFSub(b, lhs, rhs, n),
                ArithOp::FMul => core::LLVMBuildFMul(b, lhs, rhs, n),
                ArithOp::FDiv => core::LLVMBuildFDiv(b, lhs, rhs, n),
                ArithOp::FRem => core::LLVMBuildFRem(b, lhs, rhs, n),
            }
        })
    }

    fn build_compare(
        &mut self,
        pred: Predicate,
        lhs: LLVMValueRef,
        rhs: LLVMValueRef,
        name: &str,
    ) -> Result<LLVMValueRef, Error> {
        self.open_block()?;
        self.check_double(lhs)?;
        self.check_double(rhs)?;
        let pred = match pred {
            Predicate::Ult => LLVMRealPredicate::LLVMRealULT,
            Predicate::Ugt => LLVMRealPredicate::LLVMRealUGT,
            Predicate::One => LLVMRealPredicate::LLVMRealONE,
        };
        let cname = c_name(name);
        Ok(unsafe { core::LLVMBuildFCmp(self.builder, pred, lhs, rhs, cname.as_ptr()) })
    }

    fn build_bool_to_float(&mut self, value: LLVMValueRef, name: &str) -> Result<LLVMValueRef, Error> {
        self.open_block()?;
        let cname = c_name(name);
        Ok(unsafe { core::LLVMBuildUIToFP(self.builder, value, self.double_type, cname.as_ptr()) })
    }

    fn build_br(&mut self, dest: LLVMBasicBlockRef) -> Result<(), Error> {
        self.open_block()?;
        unsafe { core::LLVMBuildBr(self.builder, dest) };
        Ok(())
    }

    fn build_cond_br(
        &mut self,
        cond: LLVMValueRef,
        then: LLVMBasicBlockRef,
        els: LLVMBasicBlockRef,
    ) -> Result<(), Error> {
        self.open_block()?;
        unsafe { core::LLVMBuildCondBr(self.builder, cond, then, els) };
        Ok(())
    }

    fn build_phi(&mut self, name: &str) -> Result<LLVMValueRef, Error> {
        self.open_block()?;
        let cname = c_name(name);
        Ok(unsafe { core::LLVMBuildPhi(self.builder, self.double_type, cname.as_ptr()) })
    }

    fn add_incoming(
        &mut self,
        phi: LLVMValueRef,
        value: LLVMValueRef,
        block: LLVMBasicBlockRef,
    ) -> Result<(), Error> {
        self.check_double(value)?;
        let mut values = [value];
        let mut blocks = [block];
        unsafe { core::LLVMAddIncoming(phi, values.as_mut_ptr(), blocks.as_mut_ptr(), 1) };
        Ok(())
    }

    fn build_call(
        &mut self,
        callee: LLVMValueRef,
        args: &[LLVMValueRef],
        name: &str,
    ) -> Result<LLVMValueRef, Error> {
        self.open_block()?;
        for arg in args {
            self.check_double(*arg)?;
        }
        let mut args = args.to_vec();
        let cname = c_name(name);
        Ok(unsafe {
            core::LLVMBuildCall(
                self.builder,
                callee,
                args.as_mut_ptr(),
                args.len() as c_uint,
                cname.as_ptr(),
            )
        })
    }

    fn build_ret(&mut self, value: LLVMValueRef) -> Result<(), Error> {
        self.open_block()?;
        self.check_double(value)?;
        unsafe { core::LLVMBuildRet(self.builder, value) };
        Ok(())
    }

    fn verify_and_optimize(&mut self, function: LLVMValueRef) -> Result<(), Error> {
        unsafe {
            if LLVMVerifyFunction(function, LLVMVerifierFailureAction::LLVMReturnStatusAction) != 0
            {
                return Err(Error::backend("function failed verification"));
            }
            // simplifycfg may delete the block the builder points at.
            core::LLVMClearInsertionPosition(self.builder);
            if let Some(fpm) = self.fpm {
                core::LLVMRunFunctionPassManager(fpm, function);
            }
        }
        Ok(())
    }

    fn dump_function(&self, function: LLVMValueRef) -> String {
        unsafe { take_message(core::LLVMPrintValueToString(function)) }
    }

    fn run(&mut self, function: LLVMValueRef) -> Result<RunValue, Error> {
        unsafe {
            let result = execution_engine::LLVMRunFunction(self.engine, function, 0, null_mut());
            let value = execution_engine::LLVMGenericValueToFloat(self.double_type, result);
            execution_engine::LLVMDisposeGenericValue(result);
            Ok(RunValue::Number(value))
        }
    }
}
