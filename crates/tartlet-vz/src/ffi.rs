//! Low-level bindings: Objective-C runtime shims, Foundation helpers,
//! dispatch queues and completion blocks.
//!
//! Everything here is `unsafe` plumbing for the typed modules above; the
//! conventions are narrow: objects returned by `alloc`/`init`/`new` (or
//! explicitly retained) are owned and must be balanced with [`release`].

use std::ffi::{CStr, CString, c_char, c_void};
use std::sync::Once;

use objc2::ffi::objc_getClass;
use objc2::runtime::{AnyClass, AnyObject};
use tokio::sync::oneshot;

use crate::error::VzError;

// ============================================================================
// Framework loading
// ============================================================================

static FRAMEWORK_INIT: Once = Once::new();

/// Ensures Virtualization.framework is loaded into the process.
fn ensure_framework_loaded() {
    FRAMEWORK_INIT.call_once(|| unsafe {
        let path = CString::new(
            "/System/Library/Frameworks/Virtualization.framework/Virtualization",
        )
        .unwrap();
        let handle = libc::dlopen(path.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL);
        if handle.is_null() {
            let err = libc::dlerror();
            if !err.is_null() {
                tracing::error!(
                    error = %CStr::from_ptr(err).to_string_lossy(),
                    "failed to load Virtualization.framework"
                );
            }
        }
    });
}

/// Looks up an Objective-C class by name.
pub fn get_class(name: &str) -> Option<&'static AnyClass> {
    ensure_framework_loaded();
    let name = CString::new(name).ok()?;
    unsafe {
        let cls = objc_getClass(name.as_ptr());
        if cls.is_null() {
            None
        } else {
            Some(&*(cls as *const AnyClass))
        }
    }
}

/// Looks up a class, mapping absence to a facade error.
pub fn require_class(name: &str) -> Result<&'static AnyClass, VzError> {
    get_class(name).ok_or_else(|| VzError::Internal(format!("class {name} not found")))
}

// ============================================================================
// objc_msgSend shims
// ============================================================================

#[allow(missing_docs)]
unsafe extern "C" {
    pub fn objc_msgSend();
}

/// Sends a message returning an object pointer.
#[macro_export]
macro_rules! msg_send {
    ($obj:expr, $sel:ident) => {{
        let sel = objc2::sel!($sel);
        let func: unsafe extern "C" fn(
            *const objc2::runtime::AnyObject,
            objc2::runtime::Sel,
        ) -> *mut objc2::runtime::AnyObject =
            std::mem::transmute($crate::ffi::objc_msgSend as *const std::ffi::c_void);
        func($obj as *const _ as *const objc2::runtime::AnyObject, sel)
    }};
    ($obj:expr, $sel:ident : $arg1:expr) => {{
        let sel = objc2::sel!($sel:);
        let func: unsafe extern "C" fn(
            *const objc2::runtime::AnyObject,
            objc2::runtime::Sel,
            *const std::ffi::c_void,
        ) -> *mut objc2::runtime::AnyObject =
            std::mem::transmute($crate::ffi::objc_msgSend as *const std::ffi::c_void);
        func(
            $obj as *const _ as *const objc2::runtime::AnyObject,
            sel,
            $arg1 as *const _ as *const std::ffi::c_void,
        )
    }};
    ($obj:expr, $sel:ident : $arg1:expr, $sel2:ident : $arg2:expr) => {{
        let sel = objc2::sel!($sel:$sel2:);
        let func: unsafe extern "C" fn(
            *const objc2::runtime::AnyObject,
            objc2::runtime::Sel,
            *const std::ffi::c_void,
            *const std::ffi::c_void,
        ) -> *mut objc2::runtime::AnyObject =
            std::mem::transmute($crate::ffi::objc_msgSend as *const std::ffi::c_void);
        func(
            $obj as *const _ as *const objc2::runtime::AnyObject,
            sel,
            $arg1 as *const _ as *const std::ffi::c_void,
            $arg2 as *const _ as *const std::ffi::c_void,
        )
    }};
}

/// Sends a message returning `i64`.
#[macro_export]
macro_rules! msg_send_i64 {
    ($obj:expr, $sel:ident) => {{
        let sel = objc2::sel!($sel);
        let func: unsafe extern "C" fn(*const objc2::runtime::AnyObject, objc2::runtime::Sel) -> i64 =
            std::mem::transmute($crate::ffi::objc_msgSend as *const std::ffi::c_void);
        func($obj as *const _ as *const objc2::runtime::AnyObject, sel)
    }};
}

/// Sends a message returning `u64`.
#[macro_export]
macro_rules! msg_send_u64 {
    ($obj:expr, $sel:ident) => {{
        let sel = objc2::sel!($sel);
        let func: unsafe extern "C" fn(*const objc2::runtime::AnyObject, objc2::runtime::Sel) -> u64 =
            std::mem::transmute($crate::ffi::objc_msgSend as *const std::ffi::c_void);
        func($obj as *const _ as *const objc2::runtime::AnyObject, sel)
    }};
}

/// Sends a message returning `Bool`, optionally with one pointer argument.
#[macro_export]
macro_rules! msg_send_bool {
    ($obj:expr, $sel:ident) => {{
        let sel = objc2::sel!($sel);
        let func: unsafe extern "C" fn(
            *const objc2::runtime::AnyObject,
            objc2::runtime::Sel,
        ) -> objc2::runtime::Bool =
            std::mem::transmute($crate::ffi::objc_msgSend as *const std::ffi::c_void);
        func($obj as *const _ as *const objc2::runtime::AnyObject, sel)
    }};
    ($obj:expr, $sel:ident : $arg:expr) => {{
        let sel = objc2::sel!($sel:);
        let func: unsafe extern "C" fn(
            *const objc2::runtime::AnyObject,
            objc2::runtime::Sel,
            *const std::ffi::c_void,
        ) -> objc2::runtime::Bool =
            std::mem::transmute($crate::ffi::objc_msgSend as *const std::ffi::c_void);
        func(
            $obj as *const _ as *const objc2::runtime::AnyObject,
            sel,
            $arg as *const _ as *const std::ffi::c_void,
        )
    }};
    ($obj:expr, $sel:ident : $arg1:expr, $sel2:ident : $arg2:expr) => {{
        let sel = objc2::sel!($sel:$sel2:);
        let func: unsafe extern "C" fn(
            *const objc2::runtime::AnyObject,
            objc2::runtime::Sel,
            *const std::ffi::c_void,
            *const std::ffi::c_void,
        ) -> objc2::runtime::Bool =
            std::mem::transmute($crate::ffi::objc_msgSend as *const std::ffi::c_void);
        func(
            $obj as *const _ as *const objc2::runtime::AnyObject,
            sel,
            $arg1 as *const _ as *const std::ffi::c_void,
            $arg2 as *const _ as *const std::ffi::c_void,
        )
    }};
}

/// Sends a message with void return and one pointer argument.
#[macro_export]
macro_rules! msg_send_void {
    ($obj:expr, $sel:ident : $arg:expr) => {{
        let sel = objc2::sel!($sel:);
        let func: unsafe extern "C" fn(
            *const objc2::runtime::AnyObject,
            objc2::runtime::Sel,
            *const std::ffi::c_void,
        ) = std::mem::transmute($crate::ffi::objc_msgSend as *const std::ffi::c_void);
        func(
            $obj as *const _ as *const objc2::runtime::AnyObject,
            sel,
            $arg as *const _ as *const std::ffi::c_void,
        )
    }};
}

/// Sends a message with void return and one `u64` argument.
#[macro_export]
macro_rules! msg_send_void_u64 {
    ($obj:expr, $sel:ident : $arg:expr) => {{
        let sel = objc2::sel!($sel:);
        let func: unsafe extern "C" fn(*const objc2::runtime::AnyObject, objc2::runtime::Sel, u64) =
            std::mem::transmute($crate::ffi::objc_msgSend as *const std::ffi::c_void);
        func($obj as *const _ as *const objc2::runtime::AnyObject, sel, $arg)
    }};
}

/// Sends a message with void return and one `bool` argument.
#[macro_export]
macro_rules! msg_send_void_bool {
    ($obj:expr, $sel:ident : $arg:expr) => {{
        let sel = objc2::sel!($sel:);
        let func: unsafe extern "C" fn(
            *const objc2::runtime::AnyObject,
            objc2::runtime::Sel,
            objc2::runtime::Bool,
        ) = std::mem::transmute($crate::ffi::objc_msgSend as *const std::ffi::c_void);
        func(
            $obj as *const _ as *const objc2::runtime::AnyObject,
            sel,
            objc2::runtime::Bool::new($arg),
        )
    }};
}

// ============================================================================
// Foundation helpers
// ============================================================================

/// Creates an `NSString` from a Rust string.
pub fn nsstring(s: &str) -> *mut AnyObject {
    unsafe {
        let cls = get_class("NSString").expect("NSString class not found");
        let alloc = msg_send!(cls, alloc);
        let sel = objc2::sel!(initWithBytes:length:encoding:);
        let func: unsafe extern "C" fn(
            *mut AnyObject,
            objc2::runtime::Sel,
            *const u8,
            usize,
            u64,
        ) -> *mut AnyObject = std::mem::transmute(objc_msgSend as *const c_void);
        func(alloc, sel, s.as_ptr(), s.len(), 4) // NSUTF8StringEncoding
    }
}

/// Reads an `NSString` into a Rust `String`.
pub fn nsstring_to_string(obj: *mut AnyObject) -> String {
    if obj.is_null() {
        return String::new();
    }
    unsafe {
        let sel = objc2::sel!(UTF8String);
        let func: unsafe extern "C" fn(*const AnyObject, objc2::runtime::Sel) -> *const c_char =
            std::mem::transmute(objc_msgSend as *const c_void);
        let cstr = func(obj as *const AnyObject, sel);
        if cstr.is_null() {
            String::new()
        } else {
            CStr::from_ptr(cstr).to_string_lossy().into_owned()
        }
    }
}

/// Creates a retained file `NSURL`; relative paths are absolutized first.
pub fn nsurl_file_path(path: &str) -> *mut AnyObject {
    let abs = if std::path::Path::new(path).is_absolute() {
        path.to_string()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path).to_string_lossy().into_owned())
            .unwrap_or_else(|_| path.to_string())
    };
    unsafe {
        let cls = get_class("NSURL").expect("NSURL class not found");
        let s = nsstring(&abs);
        let url: *mut AnyObject = msg_send!(cls, fileURLWithPath: s);
        let _: *mut AnyObject = msg_send!(url, retain);
        url
    }
}

/// Creates a retained `NSURL` from an absolute URL string (`nbd://…`).
pub fn nsurl_from_string(url: &str) -> *mut AnyObject {
    unsafe {
        let cls = get_class("NSURL").expect("NSURL class not found");
        let s = nsstring(url);
        let url: *mut AnyObject = msg_send!(cls, URLWithString: s);
        if !url.is_null() {
            let _: *mut AnyObject = msg_send!(url, retain);
        }
        url
    }
}

/// Creates an `NSArray` from object pointers.
pub fn nsarray(objects: &[*mut AnyObject]) -> *mut AnyObject {
    unsafe {
        let cls = get_class("NSArray").expect("NSArray class not found");
        let sel = objc2::sel!(arrayWithObjects:count:);
        let func: unsafe extern "C" fn(
            *const AnyClass,
            objc2::runtime::Sel,
            *const *mut AnyObject,
            usize,
        ) -> *mut AnyObject = std::mem::transmute(objc_msgSend as *const c_void);
        func(cls, sel, objects.as_ptr(), objects.len())
    }
}

/// Number of elements in an `NSArray`.
pub fn nsarray_count(array: *mut AnyObject) -> usize {
    if array.is_null() {
        return 0;
    }
    unsafe {
        let sel = objc2::sel!(count);
        let func: unsafe extern "C" fn(*const AnyObject, objc2::runtime::Sel) -> usize =
            std::mem::transmute(objc_msgSend as *const c_void);
        func(array as *const AnyObject, sel)
    }
}

/// Element of an `NSArray` at `index`.
pub fn nsarray_object_at_index(array: *mut AnyObject, index: usize) -> *mut AnyObject {
    if array.is_null() {
        return std::ptr::null_mut();
    }
    unsafe {
        let sel = objc2::sel!(objectAtIndex:);
        let func: unsafe extern "C" fn(
            *const AnyObject,
            objc2::runtime::Sel,
            usize,
        ) -> *mut AnyObject = std::mem::transmute(objc_msgSend as *const c_void);
        func(array as *const AnyObject, sel, index)
    }
}

/// Creates an `NSDictionary` from parallel key/value pointer slices.
pub fn nsdictionary(
    keys: &[*mut AnyObject],
    values: &[*mut AnyObject],
) -> *mut AnyObject {
    debug_assert_eq!(keys.len(), values.len());
    unsafe {
        let cls = get_class("NSDictionary").expect("NSDictionary class not found");
        let sel = objc2::sel!(dictionaryWithObjects:forKeys:count:);
        let func: unsafe extern "C" fn(
            *const AnyClass,
            objc2::runtime::Sel,
            *const *mut AnyObject,
            *const *mut AnyObject,
            usize,
        ) -> *mut AnyObject = std::mem::transmute(objc_msgSend as *const c_void);
        func(cls, sel, values.as_ptr(), keys.as_ptr(), keys.len())
    }
}

/// Creates an `NSData` copying `bytes`.
pub fn nsdata(bytes: &[u8]) -> *mut AnyObject {
    unsafe {
        let cls = get_class("NSData").expect("NSData class not found");
        let sel = objc2::sel!(dataWithBytes:length:);
        let func: unsafe extern "C" fn(
            *const AnyClass,
            objc2::runtime::Sel,
            *const u8,
            usize,
        ) -> *mut AnyObject = std::mem::transmute(objc_msgSend as *const c_void);
        func(cls, sel, bytes.as_ptr(), bytes.len())
    }
}

/// Wraps a file descriptor in an `NSFileHandle` that does not close it.
pub fn file_handle_for_fd(fd: i32) -> *mut AnyObject {
    unsafe {
        let cls = get_class("NSFileHandle").expect("NSFileHandle class not found");
        let obj = msg_send!(cls, alloc);
        let sel = objc2::sel!(initWithFileDescriptor:closeOnDealloc:);
        let func: unsafe extern "C" fn(
            *mut AnyObject,
            objc2::runtime::Sel,
            i32,
            objc2::runtime::Bool,
        ) -> *mut AnyObject = std::mem::transmute(objc_msgSend as *const c_void);
        func(obj, sel, fd, objc2::runtime::Bool::new(false))
    }
}

/// Retains an object.
pub fn retain(obj: *mut AnyObject) -> *mut AnyObject {
    if obj.is_null() {
        return obj;
    }
    unsafe { msg_send!(obj, retain) }
}

/// Releases an owned object.
pub fn release(obj: *mut AnyObject) {
    if !obj.is_null() {
        unsafe {
            let _: *mut AnyObject = msg_send!(obj, release);
        }
    }
}

/// Converts an `NSError` into a [`VzError`].
pub fn extract_nserror(error: *mut AnyObject) -> VzError {
    if error.is_null() {
        return VzError::Internal("unknown framework error".into());
    }
    unsafe {
        let desc = msg_send!(error, localizedDescription);
        let code = msg_send_i64!(error, code);
        VzError::Framework {
            code,
            message: nsstring_to_string(desc),
        }
    }
}

// ============================================================================
// System queries
// ============================================================================

/// Whether the framework reports virtualization support.
pub fn is_supported() -> bool {
    let Some(cls) = get_class("VZVirtualMachine") else {
        return false;
    };
    unsafe { msg_send_bool!(cls, isSupported).as_bool() }
}

/// Whether nested virtualization is available on this host.
pub fn nested_supported() -> bool {
    let Some(cls) = get_class("VZGenericPlatformConfiguration") else {
        return false;
    };
    unsafe { msg_send_bool!(cls, isNestedVirtualizationSupported).as_bool() }
}

// ============================================================================
// Dispatch queue
// ============================================================================

unsafe extern "C" {
    fn dispatch_queue_create(label: *const c_char, attr: *const c_void) -> *mut AnyObject;
    fn dispatch_sync_f(
        queue: *mut AnyObject,
        context: *mut c_void,
        work: unsafe extern "C" fn(*mut c_void),
    );
    fn dispatch_release(object: *mut AnyObject);
}

/// A serial GCD queue; `VZVirtualMachine` requires all operations on one.
pub struct DispatchQueue {
    inner: *mut AnyObject,
}

unsafe impl Send for DispatchQueue {}
unsafe impl Sync for DispatchQueue {}

impl DispatchQueue {
    /// Creates a new serial queue with `label`.
    pub fn new(label: &str) -> Self {
        let label = CString::new(label).unwrap();
        let inner = unsafe { dispatch_queue_create(label.as_ptr(), std::ptr::null()) };
        Self { inner }
    }

    /// The raw queue pointer.
    pub fn as_ptr(&self) -> *mut AnyObject {
        self.inner
    }

    /// Runs `f` synchronously on the queue, returning its result.
    pub fn sync<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        struct Context<'a, F, R> {
            closure: Option<F>,
            result: &'a mut Option<R>,
        }

        unsafe extern "C" fn trampoline<F, R>(context: *mut c_void)
        where
            F: FnOnce() -> R,
        {
            unsafe {
                let ctx = &mut *(context as *mut Context<'_, F, R>);
                if let Some(f) = ctx.closure.take() {
                    *ctx.result = Some(f());
                }
            }
        }

        let mut result = None;
        let mut context = Context {
            closure: Some(f),
            result: &mut result,
        };
        unsafe {
            dispatch_sync_f(
                self.inner,
                &mut context as *mut Context<'_, F, R> as *mut c_void,
                trampoline::<F, R>,
            );
        }
        result.expect("dispatch_sync_f did not run the closure")
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        if !self.inner.is_null() {
            unsafe { dispatch_release(self.inner) };
        }
    }
}

// ============================================================================
// Completion blocks
// ============================================================================

unsafe extern "C" {
    static _NSConcreteStackBlock: *const c_void;
}

#[repr(C)]
struct BlockDescriptor {
    reserved: u64,
    size: u64,
}

/// Stack block literal for `void (^)(NSError *)` completion handlers.
///
/// The framework copies the block when the handler escapes; the copy shares
/// the `sender` pointer. There is no copy/dispose pair: ownership of the
/// sender transfers to the single invocation, which frees it.
#[repr(C)]
struct ErrorCompletionBlock {
    isa: *const c_void,
    flags: i32,
    reserved: i32,
    invoke: unsafe extern "C" fn(*mut ErrorCompletionBlock, *mut AnyObject),
    descriptor: *const BlockDescriptor,
    sender: *mut c_void,
}

static ERROR_COMPLETION_DESCRIPTOR: BlockDescriptor = BlockDescriptor {
    reserved: 0,
    size: std::mem::size_of::<ErrorCompletionBlock>() as u64,
};

unsafe extern "C" fn error_completion_invoke(
    block: *mut ErrorCompletionBlock,
    error: *mut AnyObject,
) {
    unsafe {
        let sender = (*block).sender as *mut Option<oneshot::Sender<Option<VzError>>>;
        if sender.is_null() {
            return;
        }
        let mut boxed = Box::from_raw(sender);
        if let Some(tx) = boxed.take() {
            let result = if error.is_null() {
                None
            } else {
                Some(extract_nserror(error))
            };
            let _ = tx.send(result);
        }
    }
}

/// One-shot completion handler for framework operations reporting an
/// optional `NSError`.
pub struct ErrorCompletion {
    block: ErrorCompletionBlock,
}

impl ErrorCompletion {
    /// Creates the handler and the receiver resolving with `None` on
    /// success or `Some(error)` on failure.
    pub fn new() -> (Self, oneshot::Receiver<Option<VzError>>) {
        let (tx, rx) = oneshot::channel();
        let sender: Box<Option<oneshot::Sender<Option<VzError>>>> = Box::new(Some(tx));
        let block = ErrorCompletionBlock {
            isa: unsafe { _NSConcreteStackBlock },
            flags: 0,
            reserved: 0,
            invoke: error_completion_invoke,
            descriptor: &ERROR_COMPLETION_DESCRIPTOR,
            sender: Box::into_raw(sender) as *mut c_void,
        };
        (Self { block }, rx)
    }

    /// The block pointer to pass as the completion handler argument.
    ///
    /// Valid only while `self` is alive; callers submit the operation
    /// before dropping the handler.
    pub fn as_block_ptr(&self) -> *const c_void {
        std::ptr::from_ref(&self.block) as *const c_void
    }
}
