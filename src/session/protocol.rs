//! Reply framing for the control protocol (spec.md §6 "Reply framing").

/// `ok <verb> [payload]`.
pub fn ok(verb: &str, payload: &str) -> String {
    if payload.is_empty() {
        format!("ok {verb}")
    } else {
        format!("ok {verb} {payload}")
    }
}

/// `err [context] :<message>`.
pub fn err(context: &str, message: &str) -> String {
    if context.is_empty() {
        format!("err :{message}")
    } else {
        format!("err {context} :{message}")
    }
}

/// `:<free text>` unsolicited notification.
pub fn notify(text: &str) -> String {
    format!(":{text}")
}

/// `ok <topic> <payload>` broadcast line, delivered only to clients
/// holding `<topic>` as a tag.
pub fn broadcast_line(topic: &str, payload: &str) -> String {
    ok(topic, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_omits_trailing_space_with_no_payload() {
        assert_eq!(ok("mode", ""), "ok mode");
        assert_eq!(ok("mode", "closed"), "ok mode closed");
    }

    #[test]
    fn err_formats_with_and_without_context() {
        assert_eq!(err("", "bad command"), "err :bad command");
        assert_eq!(err("set exposure", "not a number"), "err set exposure :not a number");
    }

    #[test]
    fn notify_is_colon_prefixed() {
        assert_eq!(notify("shutting down"), ":shutting down");
    }
}
