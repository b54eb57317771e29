//! Builders for the instruction documents (TwiML) returned to the carrier.
//!
//! Every dynamic value is escaped for the five standard XML entities before
//! it is embedded; free text carried in callback URLs goes through
//! `query_escape`.

/// Connect a call leg to the media-stream WebSocket, passing the room id as
/// a custom stream parameter.
pub fn connect_stream(ws_url: &str, room_id: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Connect>
        <Stream url="{}">
            <Parameter name="room" value="{}" />
        </Stream>
    </Connect>
</Response>"#,
        xml_escape(ws_url),
        xml_escape(room_id)
    )
}

/// Park a call leg in a named conference.
pub fn join_conference(conf_name: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Dial>
        <Conference startConferenceOnEnter="true" endConferenceOnExit="false">{}</Conference>
    </Dial>
</Response>"#,
        xml_escape(conf_name)
    )
}

/// Speak `text`, then gather one speech utterance and POST it to
/// `action_url`. A no-input timeout falls through the Gather, so a Redirect
/// to the same action keeps the state machine moving with an empty result.
pub fn say_and_gather(text: &str, action_url: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Gather input="speech" action="{url}" method="POST" timeout="5" speechTimeout="auto">
        <Say>{say}</Say>
    </Gather>
    <Redirect method="POST">{url}</Redirect>
</Response>"#,
        say = xml_escape(text),
        url = xml_escape(action_url)
    )
}

/// Speak a summary, then reconnect the leg to the relay stream (resume the
/// conversational loop rather than hanging up).
pub fn say_and_resume(text: &str, ws_url: &str, room_id: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Say>{}</Say>
    <Connect>
        <Stream url="{}">
            <Parameter name="room" value="{}" />
        </Stream>
    </Connect>
</Response>"#,
        xml_escape(text),
        xml_escape(ws_url),
        xml_escape(room_id)
    )
}

/// Speak a closing line and end the leg.
pub fn say_and_hangup(text: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Say>{}</Say>
    <Hangup/>
</Response>"#,
        xml_escape(text)
    )
}

/// Escape the five standard XML entities.
pub fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Percent-encoding for query parameter values.
pub fn query_escape(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                String::from(b as char)
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}
