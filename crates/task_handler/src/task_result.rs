use std::fmt::Debug;

/// Anything a handler may return: `()` or a `Result` with a debuggable error
pub trait IntoTaskHandlerResult {
    fn into_task_handler_result(self) -> Result<(), String>;
}

impl IntoTaskHandlerResult for () {
    fn into_task_handler_result(self) -> Result<(), String> {
        Ok(())
    }
}

impl<E: Debug> IntoTaskHandlerResult for Result<(), E> {
    fn into_task_handler_result(self) -> Result<(), String> {
        self.map_err(|e| format!("{e:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_is_success() {
        assert_eq!(().into_task_handler_result(), Ok(()));
    }

    #[test]
    fn errors_are_debug_formatted() {
        let result: Result<(), &str> = Err("smtp down");
        assert_eq!(
            result.into_task_handler_result(),
            Err("\"smtp down\"".to_string())
        );
    }
}
