use super::message::{Message, Role, Source, ToolInvocation, ReasoningDetail};

#[derive(Debug, Clone, PartialEq)]
pub struct ReasoningPart<'a> {
    pub reasoning: &'a str,
    pub details: &'a [ReasoningDetail],
}

/// A message's parts split by kind, each bucket in original order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionedMessage<'a> {
    pub text: Vec<&'a str>,
    pub reasoning: Vec<ReasoningPart<'a>>,
    pub sources: Vec<&'a Source>,
    pub tools: Vec<&'a ToolInvocation>,
}

/// User messages never carry reasoning or tool content, whatever the data says.
pub fn partition(message: &Message) -> PartitionedMessage<'_> {
    use super::message::Part;

    let mut out = PartitionedMessage::default();
    for part in &message.parts {
        match part {
            Part::Text { text } => out.text.push(text),
            Part::Reasoning { reasoning, details } => {
                out.reasoning.push(ReasoningPart { reasoning, details })
            }
            Part::Source { source } => out.sources.push(source),
            Part::ToolInvocation { tool_invocation } => out.tools.push(tool_invocation),
            Part::Unknown => {
                tracing::warn!(message = %message.id, "skipping part with unknown type")
            }
        }
    }
    if message.role == Role::User {
        out.reasoning.clear();
        out.tools.clear();
    }
    out
}
