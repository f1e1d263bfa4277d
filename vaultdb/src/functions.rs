//! Custom SQL functions and collations.
//!
//! Closures are boxed and handed to the engine as its user-data pointer;
//! the engine reclaims them through the destructor callback when a
//! registration is replaced or removed. Aggregate accumulators live in a
//! table keyed by the engine's per-group context identity rather than
//! inside engine-allocated memory.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::ffi::CString;
use std::os::raw::{c_int, c_void};
use std::sync::{Mutex, PoisonError};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::ffi;
use crate::statement;
use crate::value::Value;

// ── Flags ───────────────────────────────────────────────────────────────

/// Properties of a registered function, mapped onto the engine's
/// function-flag bits alongside the UTF-8 encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionFlags {
    deterministic: bool,
    direct_only: bool,
    innocuous: bool,
}

impl FunctionFlags {
    /// The function always gives the same output for the same inputs.
    #[must_use]
    pub const fn deterministic(mut self) -> Self {
        self.deterministic = true;
        self
    }

    /// The function may only be invoked from top-level SQL, not from
    /// triggers, views or schema structures.
    #[must_use]
    pub const fn direct_only(mut self) -> Self {
        self.direct_only = true;
        self
    }

    /// The function is safe to use inside schema structures.
    #[must_use]
    pub const fn innocuous(mut self) -> Self {
        self.innocuous = true;
        self
    }

    const fn bits(self) -> c_int {
        let mut bits = ffi::SQLITE_UTF8;
        if self.deterministic {
            bits |= ffi::SQLITE_DETERMINISTIC;
        }
        if self.direct_only {
            bits |= ffi::SQLITE_DIRECTONLY;
        }
        if self.innocuous {
            bits |= ffi::SQLITE_INNOCUOUS;
        }
        bits
    }
}

// ── Aggregate traits ────────────────────────────────────────────────────

/// A user-defined aggregate function.
///
/// One accumulator exists per aggregation group; it is created on the
/// group's first step and consumed at finalization.
pub trait Aggregate: Send + Sync + 'static {
    /// Per-group accumulator.
    type State: Send;

    /// Creates a fresh accumulator.
    fn init(&self) -> Self::State;

    /// Folds one row's arguments into the accumulator.
    fn step(&self, state: &mut Self::State, args: &[Value]) -> Result<()>;

    /// Consumes the accumulator and produces the aggregate result.
    ///
    /// Also called for empty groups, with a freshly initialized
    /// accumulator.
    fn finalize(&self, state: Self::State) -> Result<Value>;
}

/// A user-defined window function: an [`Aggregate`] that can additionally
/// report intermediate values and retract rows from the current window.
pub trait WindowAggregate: Aggregate {
    /// The aggregate result for the current window, without consuming the
    /// accumulator.
    fn value(&self, state: &Self::State) -> Result<Value>;

    /// Removes one row's arguments from the accumulator as the window
    /// slides forward.
    fn inverse(&self, state: &mut Self::State, args: &[Value]) -> Result<()>;
}

// ── Boxed callback types ────────────────────────────────────────────────

type ScalarCallback = Box<dyn Fn(&[Value]) -> Result<Value> + Send>;
type CollationCallback = Box<dyn Fn(&str, &str) -> Ordering + Send>;

/// User data for aggregate and window registrations: the implementation
/// plus the accumulator table keyed by per-group context identity.
struct AggregateData<A: Aggregate> {
    agg: A,
    states: Mutex<HashMap<usize, A::State>>,
}

impl<A: Aggregate> AggregateData<A> {
    fn take_state(&self, key: usize) -> A::State {
        if key == 0 {
            return self.agg.init();
        }
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key)
            .unwrap_or_else(|| self.agg.init())
    }
}

// ── Registration ────────────────────────────────────────────────────────

impl Connection {
    /// Registers a scalar SQL function.
    ///
    /// `n_args` of `-1` accepts any arity. Registering the same name and
    /// arity again replaces the previous function and frees its closure.
    pub fn create_scalar_function<F>(
        &self,
        name: &str,
        n_args: i32,
        flags: FunctionFlags,
        f: F,
    ) -> Result<()>
    where
        F: Fn(&[Value]) -> Result<Value> + Send + 'static,
    {
        let c_name = function_name(name)?;
        let boxed: Box<ScalarCallback> = Box::new(Box::new(f));
        let user_data = Box::into_raw(boxed).cast::<c_void>();
        // Safety: on failure the engine invokes the destructor on
        // `user_data`, so ownership transfers unconditionally here.
        let rc = unsafe {
            ffi::sqlite3_create_function_v2(
                self.handle(),
                c_name.as_ptr(),
                n_args,
                flags.bits(),
                user_data,
                Some(scalar_trampoline),
                None,
                None,
                Some(drop_boxed::<ScalarCallback>),
            )
        };
        self.registration_result(rc)
    }

    /// Registers an aggregate SQL function.
    pub fn create_aggregate_function<A>(
        &self,
        name: &str,
        n_args: i32,
        flags: FunctionFlags,
        agg: A,
    ) -> Result<()>
    where
        A: Aggregate,
    {
        let c_name = function_name(name)?;
        let data = Box::new(AggregateData {
            agg,
            states: Mutex::new(HashMap::new()),
        });
        let user_data = Box::into_raw(data).cast::<c_void>();
        // Safety: as in `create_scalar_function`, the destructor owns
        // `user_data` from here on.
        let rc = unsafe {
            ffi::sqlite3_create_function_v2(
                self.handle(),
                c_name.as_ptr(),
                n_args,
                flags.bits(),
                user_data,
                None,
                Some(aggregate_step::<A>),
                Some(aggregate_final::<A>),
                Some(drop_boxed::<AggregateData<A>>),
            )
        };
        self.registration_result(rc)
    }

    /// Registers a window SQL function.
    pub fn create_window_function<A>(
        &self,
        name: &str,
        n_args: i32,
        flags: FunctionFlags,
        agg: A,
    ) -> Result<()>
    where
        A: WindowAggregate,
    {
        let c_name = function_name(name)?;
        let data = Box::new(AggregateData {
            agg,
            states: Mutex::new(HashMap::new()),
        });
        let user_data = Box::into_raw(data).cast::<c_void>();
        // Safety: as in `create_scalar_function`, the destructor owns
        // `user_data` from here on.
        let rc = unsafe {
            ffi::sqlite3_create_window_function(
                self.handle(),
                c_name.as_ptr(),
                n_args,
                flags.bits(),
                user_data,
                Some(aggregate_step::<A>),
                Some(aggregate_final::<A>),
                Some(window_value::<A>),
                Some(window_inverse::<A>),
                Some(drop_boxed::<AggregateData<A>>),
            )
        };
        self.registration_result(rc)
    }

    /// Removes a previously registered function of the given arity.
    pub fn remove_function(&self, name: &str, n_args: i32) -> Result<()> {
        let c_name = function_name(name)?;
        // Safety: all-null callbacks delete the registration; the old
        // closure is freed through its own destructor.
        let rc = unsafe {
            ffi::sqlite3_create_function_v2(
                self.handle(),
                c_name.as_ptr(),
                n_args,
                ffi::SQLITE_UTF8,
                std::ptr::null_mut(),
                None,
                None,
                None,
                None,
            )
        };
        self.registration_result(rc)
    }

    /// Registers a collation. Invalid UTF-8 input falls back to a bytewise
    /// comparison so the ordering stays total.
    pub fn create_collation<F>(&self, name: &str, cmp: F) -> Result<()>
    where
        F: Fn(&str, &str) -> Ordering + Send + 'static,
    {
        let c_name = function_name(name)?;
        let boxed: Box<CollationCallback> = Box::new(Box::new(cmp));
        let user_data = Box::into_raw(boxed).cast::<c_void>();
        // Safety: unlike function registration, a failed collation
        // registration does not invoke the destructor, so the box is
        // reclaimed manually on the error path.
        let rc = unsafe {
            ffi::sqlite3_create_collation_v2(
                self.handle(),
                c_name.as_ptr(),
                ffi::SQLITE_UTF8,
                user_data,
                Some(collation_trampoline),
                Some(drop_boxed::<CollationCallback>),
            )
        };
        if rc != ffi::SQLITE_OK {
            // Safety: the engine did not take ownership.
            unsafe {
                drop(Box::from_raw(user_data.cast::<CollationCallback>()));
            }
            return Err(Error::from_code(rc, statement::error_message(self.handle())));
        }
        Ok(())
    }

    /// Removes a previously registered collation.
    pub fn remove_collation(&self, name: &str) -> Result<()> {
        let c_name = function_name(name)?;
        // Safety: a null comparator deletes the registration.
        let rc = unsafe {
            ffi::sqlite3_create_collation_v2(
                self.handle(),
                c_name.as_ptr(),
                ffi::SQLITE_UTF8,
                std::ptr::null_mut(),
                None,
                None,
            )
        };
        self.registration_result(rc)
    }

    fn registration_result(&self, rc: c_int) -> Result<()> {
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(Error::from_code(rc, statement::error_message(self.handle())))
        }
    }
}

fn function_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Error::Parameter("function name contains a nul byte".to_string()))
}

// ── Trampolines ─────────────────────────────────────────────────────────

/// Reclaims a boxed callback when the engine discards a registration.
unsafe extern "C" fn drop_boxed<T>(user_data: *mut c_void) {
    drop(Box::from_raw(user_data.cast::<T>()));
}

unsafe extern "C" fn scalar_trampoline(ctx: *mut c_void, argc: c_int, argv: *mut *mut c_void) {
    let f = &*ffi::sqlite3_user_data(ctx).cast::<ScalarCallback>();
    let args = marshal_args(argc, argv);
    match f(&args) {
        Ok(value) => set_result(ctx, &value),
        Err(err) => set_error(ctx, &err),
    }
}

unsafe extern "C" fn aggregate_step<A: Aggregate>(
    ctx: *mut c_void,
    argc: c_int,
    argv: *mut *mut c_void,
) {
    let data = &*ffi::sqlite3_user_data(ctx).cast::<AggregateData<A>>();
    // One byte of engine-managed memory anchors the group's identity.
    let key = ffi::sqlite3_aggregate_context(ctx, 1) as usize;
    if key == 0 {
        ffi::sqlite3_result_error_code(ctx, ffi::SQLITE_NOMEM);
        return;
    }
    let args = marshal_args(argc, argv);
    let mut states = data.states.lock().unwrap_or_else(PoisonError::into_inner);
    let state = states.entry(key).or_insert_with(|| data.agg.init());
    if let Err(err) = data.agg.step(state, &args) {
        set_error(ctx, &err);
    }
}

unsafe extern "C" fn aggregate_final<A: Aggregate>(ctx: *mut c_void) {
    let data = &*ffi::sqlite3_user_data(ctx).cast::<AggregateData<A>>();
    // Zero bytes: probe for an existing group without allocating one for
    // empty aggregations.
    let key = ffi::sqlite3_aggregate_context(ctx, 0) as usize;
    let state = data.take_state(key);
    match data.agg.finalize(state) {
        Ok(value) => set_result(ctx, &value),
        Err(err) => set_error(ctx, &err),
    }
}

unsafe extern "C" fn window_value<A: WindowAggregate>(ctx: *mut c_void) {
    let data = &*ffi::sqlite3_user_data(ctx).cast::<AggregateData<A>>();
    let key = ffi::sqlite3_aggregate_context(ctx, 0) as usize;
    let states = data.states.lock().unwrap_or_else(PoisonError::into_inner);
    let result = match states.get(&key) {
        Some(state) => data.agg.value(state),
        None => {
            let fresh = data.agg.init();
            data.agg.value(&fresh)
        }
    };
    match result {
        Ok(value) => set_result(ctx, &value),
        Err(err) => set_error(ctx, &err),
    }
}

unsafe extern "C" fn window_inverse<A: WindowAggregate>(
    ctx: *mut c_void,
    argc: c_int,
    argv: *mut *mut c_void,
) {
    let data = &*ffi::sqlite3_user_data(ctx).cast::<AggregateData<A>>();
    let key = ffi::sqlite3_aggregate_context(ctx, 0) as usize;
    let args = marshal_args(argc, argv);
    let mut states = data.states.lock().unwrap_or_else(PoisonError::into_inner);
    let state = states.entry(key).or_insert_with(|| data.agg.init());
    if let Err(err) = data.agg.inverse(state, &args) {
        set_error(ctx, &err);
    }
}

unsafe extern "C" fn collation_trampoline(
    user_data: *mut c_void,
    n_lhs: c_int,
    lhs: *const c_void,
    n_rhs: c_int,
    rhs: *const c_void,
) -> c_int {
    let cmp = &*user_data.cast::<CollationCallback>();
    let lhs = byte_slice(lhs, n_lhs);
    let rhs = byte_slice(rhs, n_rhs);
    let ordering = match (std::str::from_utf8(lhs), std::str::from_utf8(rhs)) {
        (Ok(l), Ok(r)) => cmp(l, r),
        _ => lhs.cmp(rhs),
    };
    match ordering {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

// ── Marshalling ─────────────────────────────────────────────────────────

/// Decodes the native argument array into [`Value`]s.
///
/// # Safety
///
/// `argv` must point to `argc` valid `sqlite3_value*` handles.
unsafe fn marshal_args(argc: c_int, argv: *mut *mut c_void) -> Vec<Value> {
    let count = usize::try_from(argc).unwrap_or(0);
    (0..count).map(|i| marshal_value(*argv.add(i))).collect()
}

unsafe fn marshal_value(value: *mut c_void) -> Value {
    match ffi::sqlite3_value_type(value) {
        ffi::SQLITE_INTEGER => Value::Integer(ffi::sqlite3_value_int64(value)),
        ffi::SQLITE_FLOAT => Value::Float(ffi::sqlite3_value_double(value)),
        ffi::SQLITE_TEXT => {
            let ptr = ffi::sqlite3_value_text(value);
            let len = ffi::sqlite3_value_bytes(value);
            if ptr.is_null() || len <= 0 {
                Value::Text(String::new())
            } else {
                #[allow(clippy::cast_sign_loss)]
                let bytes = std::slice::from_raw_parts(ptr, len as usize);
                Value::Text(String::from_utf8_lossy(bytes).into_owned())
            }
        }
        ffi::SQLITE_BLOB => {
            let ptr = ffi::sqlite3_value_blob(value);
            let len = ffi::sqlite3_value_bytes(value);
            if ptr.is_null() || len <= 0 {
                Value::Blob(Vec::new())
            } else {
                #[allow(clippy::cast_sign_loss)]
                Value::Blob(std::slice::from_raw_parts(ptr.cast::<u8>(), len as usize).to_vec())
            }
        }
        ffi::SQLITE_NULL => Value::Null,
        other => panic!("unknown value storage class: {other}"),
    }
}

/// Writes `value` into the native result slot.
unsafe fn set_result(ctx: *mut c_void, value: &Value) {
    match value {
        Value::Integer(v) => ffi::sqlite3_result_int64(ctx, *v),
        Value::Float(v) => ffi::sqlite3_result_double(ctx, *v),
        Value::Text(v) => ffi::sqlite3_result_text(
            ctx,
            v.as_ptr().cast(),
            c_int::try_from(v.len()).unwrap_or(c_int::MAX),
            ffi::SQLITE_TRANSIENT,
        ),
        Value::Blob(v) => ffi::sqlite3_result_blob(
            ctx,
            v.as_ptr().cast(),
            c_int::try_from(v.len()).unwrap_or(c_int::MAX),
            ffi::SQLITE_TRANSIENT,
        ),
        Value::Null => ffi::sqlite3_result_null(ctx),
    }
}

unsafe fn set_error(ctx: *mut c_void, err: &Error) {
    let message = err.to_string();
    ffi::sqlite3_result_error(
        ctx,
        message.as_ptr().cast(),
        c_int::try_from(message.len()).unwrap_or(c_int::MAX),
    );
}

unsafe fn byte_slice<'a>(ptr: *const c_void, len: c_int) -> &'a [u8] {
    if ptr.is_null() || len <= 0 {
        &[]
    } else {
        #[allow(clippy::cast_sign_loss)]
        std::slice::from_raw_parts(ptr.cast::<u8>(), len as usize)
    }
}
