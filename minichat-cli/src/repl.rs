use minichat::{ChatSession, Message};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Run one generation, echoing streamed text as it arrives. Ctrl-C stops the
/// generation; the reply is then `None`.
async fn generate(session: &ChatSession, history: Vec<Message>) -> anyhow::Result<Option<Message>> {
    let mut content = session.subscribe();
    let mut task = {
        let session = session.clone();
        tokio::spawn(async move { session.send_message(history).await })
    };

    let mut stdout = std::io::stdout();
    let mut printed = 0usize;
    let mut stopped = false;

    let reply = loop {
        tokio::select! {
            result = &mut task => break result?,
            Ok(()) = content.changed() => {
                let text = content.borrow_and_update().clone();
                // Content only shrinks when the generation ends.
                if text.len() > printed {
                    write!(stdout, "{}", &text[printed..])?;
                    stdout.flush()?;
                    printed = text.len();
                }
            }
            _ = tokio::signal::ctrl_c(), if !stopped => {
                session.stop_generation();
                stopped = true;
                writeln!(stdout, "\n[stopped]")?;
            }
        }
    };

    if let Some(message) = &reply {
        // Tail that arrived after the last change notification, or the whole
        // reply when not streaming.
        if message.content.len() > printed && message.content.is_char_boundary(printed) {
            write!(stdout, "{}", &message.content[printed..])?;
        }
        writeln!(stdout)?;
    }
    Ok(reply)
}

pub async fn run_ask(session: &ChatSession, prompt: String) -> anyhow::Result<()> {
    match generate(session, vec![Message::user(prompt)]).await? {
        Some(_) => Ok(()),
        None => anyhow::bail!("no reply received"),
    }
}

pub async fn run_chat(session: &ChatSession) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut history: Vec<Message> = Vec::new();
    let mut stdout = std::io::stdout();

    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let Some(line) = lines.next_line().await? else {
            writeln!(stdout)?;
            break;
        };
        let input = line.trim();
        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                history.clear();
                writeln!(stdout, "[history cleared]")?;
                continue;
            }
            _ => {}
        }

        history.push(Message::user(input));
        match generate(session, history.clone()).await? {
            Some(reply) => history.push(reply),
            // A failed or stopped turn leaves no trace in the conversation.
            None => {
                history.pop();
            }
        }
    }
    Ok(())
}
