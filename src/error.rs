use std::any::Any;
use std::fmt::{self, Display};

/// Bounds for the errors that surface from running the operator. They're typically boxed and may
/// need to cross threads.
pub trait OperatorError: std::error::Error + Send + 'static + Any {
    fn as_any(&self) -> &dyn Any;
}
impl<T> OperatorError for T
where
    T: std::error::Error + Send + 'static + Any,
{
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub type Error = Box<dyn OperatorError>;

impl dyn OperatorError {
    /// convenience function for downcasting the error to a concrete type
    pub fn as_type<T: OperatorError>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// If this returns true, then `as_type::<T>()` will return `Some`
    pub fn is_type<T: OperatorError>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

impl<T> From<T> for Error
where
    T: OperatorError,
{
    fn from(e: T) -> Error {
        Box::new(e)
    }
}

/// Returned when the operator stops for any reason, since it's expected to run forever
#[derive(Debug)]
pub struct UnexpectedShutdownError;

impl Display for UnexpectedShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Operator shutdown due to an unexpected error")
    }
}
impl std::error::Error for UnexpectedShutdownError {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn boxed_error_can_be_downcast() {
        let err: Error = UnexpectedShutdownError.into();
        assert!(err.is_type::<UnexpectedShutdownError>());
        assert!(err.as_type::<std::io::Error>().is_none());
    }
}
