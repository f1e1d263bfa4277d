//! Custom FTS5 tokenizer registration.
//!
//! The FTS5 extension API is obtained through the engine itself (a
//! pointer-valued result of the `fts5()` SQL function); registration then
//! follows the same boxed-closure and destructor discipline as custom
//! functions.

use std::ffi::{CStr, CString};
use std::ops::Range;
use std::os::raw::{c_char, c_int, c_void};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::ffi;
use crate::statement::StepResult;

/// Why the engine is tokenizing a piece of text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizeReason {
    /// Document content being indexed.
    Document,
    /// A query term; `prefix` marks a trailing-`*` prefix query.
    Query {
        /// The term ends in a prefix wildcard.
        prefix: bool,
    },
    /// An auxiliary function (e.g. `highlight()`) re-tokenizing stored
    /// text.
    Aux,
}

impl TokenizeReason {
    const fn decode(flags: c_int) -> Self {
        if flags & ffi::FTS5_TOKENIZE_QUERY != 0 {
            Self::Query {
                prefix: flags & ffi::FTS5_TOKENIZE_PREFIX != 0,
            }
        } else if flags & ffi::FTS5_TOKENIZE_AUX != 0 {
            Self::Aux
        } else {
            Self::Document
        }
    }
}

/// Receives the tokens a tokenizer emits for one piece of text.
pub struct TokenSink {
    ctx: *mut c_void,
    push: ffi::fts5_token_callback,
}

impl TokenSink {
    /// Emits one token covering `range` (byte offsets into the input
    /// text). A colocated token occupies the same position as the previous
    /// one.
    pub fn push(&mut self, token: &str, range: Range<usize>, colocated: bool) -> Result<()> {
        let flags = if colocated {
            ffi::FTS5_TOKEN_COLOCATED
        } else {
            0
        };
        // Safety: `ctx` and `push` were handed to `xTokenize` by the
        // engine and stay valid for the duration of that call.
        let rc = unsafe {
            (self.push)(
                self.ctx,
                flags,
                token.as_ptr().cast(),
                c_int::try_from(token.len()).map_err(|_| Error::Misuse)?,
                c_int::try_from(range.start).map_err(|_| Error::Misuse)?,
                c_int::try_from(range.end).map_err(|_| Error::Misuse)?,
            )
        };
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(Error::Other {
                code: rc,
                message: "token rejected by full-text engine".to_string(),
            })
        }
    }
}

/// A custom FTS5 tokenizer instance.
pub trait Fts5Tokenizer: Send + 'static {
    /// Splits `text` into tokens, pushing each through `sink`.
    fn tokenize(&self, reason: TokenizeReason, text: &str, sink: &mut TokenSink) -> Result<()>;
}

/// Boxed tokenizer factory; receives the arguments from the
/// `tokenize = '<name> <args>'` table option.
pub type TokenizerFactory = Box<dyn Fn(&[String]) -> Result<Box<dyn Fts5Tokenizer>> + Send + Sync>;

type TokenizerInstance = Box<dyn Fts5Tokenizer>;

static TOKENIZER_VTABLE: ffi::fts5_tokenizer = ffi::fts5_tokenizer {
    xCreate: tokenizer_create,
    xDelete: tokenizer_delete,
    xTokenize: tokenizer_tokenize,
};

impl Connection {
    /// Registers an FTS5 tokenizer under `name`.
    ///
    /// The factory runs when a virtual table naming this tokenizer is
    /// created or reopened. Fails with [`Error::Other`] if the linked
    /// engine was built without FTS5.
    pub fn register_fts5_tokenizer<F>(&self, name: &str, factory: F) -> Result<()>
    where
        F: Fn(&[String]) -> Result<Box<dyn Fts5Tokenizer>> + Send + Sync + 'static,
    {
        let api = self.fts5_api()?;
        let c_name = CString::new(name)
            .map_err(|_| Error::Parameter("tokenizer name contains a nul byte".to_string()))?;
        let boxed: Box<TokenizerFactory> = Box::new(Box::new(factory));
        let user_data = Box::into_raw(boxed).cast::<c_void>();
        // Safety: `api` was produced by the engine for this connection;
        // the vtable is 'static. A failed registration does not take
        // ownership of `user_data`, so it is reclaimed manually below.
        let rc = unsafe {
            ((*api).xCreateTokenizer)(
                api,
                c_name.as_ptr(),
                user_data,
                std::ptr::addr_of!(TOKENIZER_VTABLE).cast_mut(),
                Some(drop_factory),
            )
        };
        if rc != ffi::SQLITE_OK {
            // Safety: the engine did not store the pointer.
            unsafe {
                drop(Box::from_raw(user_data.cast::<TokenizerFactory>()));
            }
            return Err(Error::Other {
                code: rc,
                message: "tokenizer registration failed".to_string(),
            });
        }
        Ok(())
    }

    /// Fetches the FTS5 extension API through the pointer-valued `fts5()`
    /// SQL function.
    fn fts5_api(&self) -> Result<*mut ffi::fts5_api> {
        let mut api: *mut ffi::fts5_api = std::ptr::null_mut();
        let mut stmt = self.prepare("SELECT fts5(?1)").map_err(|_| Error::Other {
            code: ffi::SQLITE_ERROR,
            message: "full-text engine unavailable".to_string(),
        })?;
        let type_name = CString::new("fts5_api_ptr").map_err(|_| Error::Misuse)?;
        // Safety: the statement is live; the engine writes the API pointer
        // through the bound out-pointer during the step below.
        let rc = unsafe {
            ffi::sqlite3_bind_pointer(
                stmt.raw_handle(),
                1,
                std::ptr::addr_of_mut!(api).cast(),
                type_name.as_ptr(),
                None,
            )
        };
        if rc != ffi::SQLITE_OK {
            return Err(stmt.last_error(rc));
        }
        if stmt.step()? != StepResult::Row || api.is_null() {
            return Err(Error::Other {
                code: ffi::SQLITE_ERROR,
                message: "full-text engine unavailable".to_string(),
            });
        }
        Ok(api)
    }
}

// ── C-side callbacks ────────────────────────────────────────────────────

unsafe extern "C" fn tokenizer_create(
    user_data: *mut c_void,
    az_arg: *mut *const c_char,
    n_arg: c_int,
    pp_out: *mut *mut c_void,
) -> c_int {
    let factory = &*user_data.cast::<TokenizerFactory>();
    let count = usize::try_from(n_arg).unwrap_or(0);
    let args: Vec<String> = (0..count)
        .filter_map(|i| {
            let ptr = *az_arg.add(i);
            if ptr.is_null() {
                None
            } else {
                Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
            }
        })
        .collect();
    match factory(&args) {
        Ok(instance) => {
            *pp_out = Box::into_raw(Box::new(instance)).cast();
            ffi::SQLITE_OK
        }
        Err(_) => ffi::SQLITE_ERROR,
    }
}

unsafe extern "C" fn tokenizer_delete(tokenizer: *mut c_void) {
    drop(Box::from_raw(tokenizer.cast::<TokenizerInstance>()));
}

unsafe extern "C" fn tokenizer_tokenize(
    tokenizer: *mut c_void,
    ctx: *mut c_void,
    flags: c_int,
    text: *const c_char,
    n_text: c_int,
    x_token: ffi::fts5_token_callback,
) -> c_int {
    let instance = &*tokenizer.cast::<TokenizerInstance>();
    let bytes = if text.is_null() || n_text <= 0 {
        &[]
    } else {
        #[allow(clippy::cast_sign_loss)]
        std::slice::from_raw_parts(text.cast::<u8>(), n_text as usize)
    };
    let Ok(text) = std::str::from_utf8(bytes) else {
        return ffi::SQLITE_ERROR;
    };
    let mut sink = TokenSink { ctx, push: x_token };
    match instance.tokenize(TokenizeReason::decode(flags), text, &mut sink) {
        Ok(()) => ffi::SQLITE_OK,
        Err(Error::Other { code, .. }) => code,
        Err(_) => ffi::SQLITE_ERROR,
    }
}

unsafe extern "C" fn drop_factory(user_data: *mut c_void) {
    drop(Box::from_raw(user_data.cast::<TokenizerFactory>()));
}
