//! Renders call instructions into TwiML voice-response documents.
//!
//! Each webhook reply carries exactly one instruction. `Speak` and
//! `PlayAudio` wrap their content in a speech-capture verb when a reply is
//! expected; terminal variants append a hangup. `Hangup` itself says the
//! localized farewell first, which keeps the instruction surface minimal
//! while the call still ends politely.

use crate::locale::Locale;
use crate::telephony::Instruction;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

/// Per-locale platform TTS voice for `<Say>` verbs.
pub fn say_voice(locale: Locale) -> &'static str {
    match locale {
        Locale::En => "Polly.Joanna",
        Locale::Es => "Polly.Conchita",
        Locale::Fr => "Polly.Celine",
        Locale::De => "Polly.Marlene",
        Locale::It => "Polly.Carla",
        Locale::Pt => "Polly.Camila",
    }
}

/// Everything the renderer needs besides the instruction itself.
pub struct TwimlContext<'a> {
    pub public_url: &'a str,
    pub call_id: &'a str,
    pub locale: Locale,
    pub farewell: &'a str,
    pub gather_timeout_secs: u32,
}

impl<'a> TwimlContext<'a> {
    fn collect_action(&self) -> String {
        format!("{}/voice/collect", self.public_url.trim_end_matches('/'))
    }

    fn voice_action(&self) -> String {
        format!("{}/voice", self.public_url.trim_end_matches('/'))
    }

    fn artifact_url(&self, key: &str) -> String {
        format!("{}/audio/{key}", self.public_url.trim_end_matches('/'))
    }
}

/// Render one instruction as a complete TwiML document.
pub fn render(instruction: &Instruction, ctx: &TwimlContext) -> anyhow::Result<String> {
    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("Response")))?;

    match instruction {
        Instruction::Speak {
            text,
            voice,
            locale,
            expects_reply,
        } => {
            if *expects_reply {
                open_gather(&mut writer, ctx, *locale)?;
                write_say(&mut writer, voice, *locale, text)?;
                writer.write_event(Event::End(BytesEnd::new("Gather")))?;
            } else {
                write_say(&mut writer, voice, *locale, text)?;
                writer.write_event(Event::Empty(BytesStart::new("Hangup")))?;
            }
        }
        Instruction::PlayAudio {
            artifact_key,
            expects_reply,
        } => {
            let url = ctx.artifact_url(artifact_key);
            if *expects_reply {
                open_gather(&mut writer, ctx, ctx.locale)?;
                write_text_element(&mut writer, "Play", &url)?;
                writer.write_event(Event::End(BytesEnd::new("Gather")))?;
            } else {
                write_text_element(&mut writer, "Play", &url)?;
                writer.write_event(Event::Empty(BytesStart::new("Hangup")))?;
            }
        }
        Instruction::OpenDuplexStream { endpoint } => {
            // The action URL gets the post-stream callback, which is how a
            // call re-enters webhook turns after its stream leg ends.
            let action = ctx.voice_action();
            let mut connect = BytesStart::new("Connect");
            connect.push_attribute(("action", action.as_str()));
            writer.write_event(Event::Start(connect))?;
            let mut stream = BytesStart::new("Stream");
            stream.push_attribute(("url", endpoint.as_str()));
            writer.write_event(Event::Start(stream))?;
            let mut param = BytesStart::new("Parameter");
            param.push_attribute(("name", "call_id"));
            param.push_attribute(("value", ctx.call_id));
            writer.write_event(Event::Empty(param))?;
            writer.write_event(Event::End(BytesEnd::new("Stream")))?;
            writer.write_event(Event::End(BytesEnd::new("Connect")))?;
        }
        Instruction::Redirect { target } => {
            let mut redirect = BytesStart::new("Redirect");
            redirect.push_attribute(("method", "POST"));
            writer.write_event(Event::Start(redirect))?;
            writer.write_event(Event::Text(BytesText::new(target)))?;
            writer.write_event(Event::End(BytesEnd::new("Redirect")))?;
        }
        Instruction::Hangup => {
            if !ctx.farewell.is_empty() {
                write_say(&mut writer, say_voice(ctx.locale), ctx.locale, ctx.farewell)?;
            }
            writer.write_event(Event::Empty(BytesStart::new("Hangup")))?;
        }
    }

    writer.write_event(Event::End(BytesEnd::new("Response")))?;
    Ok(String::from_utf8(writer.into_inner())?)
}

/// Empty response document, used when an event produced no instruction.
pub fn empty_response() -> String {
    "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response></Response>".to_string()
}

fn open_gather<W: std::io::Write>(
    writer: &mut Writer<W>,
    ctx: &TwimlContext,
    locale: Locale,
) -> anyhow::Result<()> {
    let timeout = ctx.gather_timeout_secs.to_string();
    let action = ctx.collect_action();
    let mut gather = BytesStart::new("Gather");
    gather.push_attribute(("input", "speech"));
    gather.push_attribute(("action", action.as_str()));
    gather.push_attribute(("method", "POST"));
    gather.push_attribute(("timeout", timeout.as_str()));
    gather.push_attribute(("speechTimeout", "auto"));
    gather.push_attribute(("language", locale.tag()));
    // Post back even on silence so the orchestrator sees the timeout.
    gather.push_attribute(("actionOnEmptyResult", "true"));
    writer.write_event(Event::Start(gather))?;
    Ok(())
}

fn write_say<W: std::io::Write>(
    writer: &mut Writer<W>,
    voice: &str,
    locale: Locale,
    text: &str,
) -> anyhow::Result<()> {
    let mut say = BytesStart::new("Say");
    say.push_attribute(("voice", voice));
    say.push_attribute(("language", locale.tag()));
    writer.write_event(Event::Start(say))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new("Say")))?;
    Ok(())
}

fn write_text_element<W: std::io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    text: &str,
) -> anyhow::Result<()> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}
