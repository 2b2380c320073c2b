use anyhow::Result;

use whisper_core::nudge::{Reply, ReplySource};
use whisper_core::service::WhisperService;

use super::helpers::print_json;

fn print_reply(reply: &Reply, json: bool) -> Result<()> {
    if json {
        return print_json(reply);
    }
    println!("{}", reply.text);
    if reply.source == ReplySource::Fallback {
        eprintln!("(language model unavailable; showing a fallback reply)");
    }
    Ok(())
}

pub(crate) fn cmd_nudge(
    svc: &WhisperService<'_>,
    uid: &str,
    ask: Option<&str>,
    force: bool,
    json: bool,
) -> Result<()> {
    let ctx = svc.context(uid)?;
    if !force && ask.is_none() && !svc.nudge_due(&ctx)? {
        if json {
            println!("{}", serde_json::json!({ "due": false }));
        } else {
            eprintln!("Quiet hours or nudges are off. Use --force to get one anyway.");
        }
        return Ok(());
    }
    let reply = svc.nudge(&ctx, ask)?;
    print_reply(&reply, json)
}

pub(crate) fn cmd_chat(svc: &WhisperService<'_>, uid: &str, text: &str, json: bool) -> Result<()> {
    let ctx = svc.context(uid)?;
    let reply = svc.chat(&ctx, text)?;
    print_reply(&reply, json)
}
