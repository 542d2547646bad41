use concierge_types::{FieldSpec, FieldType, Normalizer, ToolSchema};

/// Capabilities the assistant ships with. Order matters: it is the final
/// tie-break when two candidates score the same.
pub fn builtin_catalog() -> Vec<ToolSchema> {
    vec![
        ToolSchema::new("calendar_create", "Create a calendar event")
            .field(
                FieldSpec::required("title", FieldType::String)
                    .with_description("Short name of the event, e.g. \"gym\" or \"lunch with Ana\""),
            )
            .field(FieldSpec::required("date", FieldType::Date).with_description("Day of the event"))
            .field(FieldSpec::required("time", FieldType::Time).with_description("Start time"))
            .field(FieldSpec::optional("location", FieldType::String))
            .field(FieldSpec::optional("description", FieldType::FreeText)),
        ToolSchema::new("reminder_create", "Remind the user to do something at a given time")
            .field(
                FieldSpec::required("title", FieldType::String)
                    .with_description("What to be reminded about, e.g. \"call Jim\""),
            )
            .field(FieldSpec::required("date", FieldType::Date))
            .field(FieldSpec::required("time", FieldType::Time)),
        ToolSchema::new("calendar_check", "List upcoming calendar events")
            .field(FieldSpec::optional("date", FieldType::Date).with_description("Day to inspect")),
        ToolSchema::new("calendar_search", "Find past or upcoming calendar events").field(
            FieldSpec::required("query", FieldType::FreeText)
                .with_description("Words to look for in event titles, e.g. \"dentist\""),
        ),
        ToolSchema::new("email_send", "Send an email")
            .field(
                FieldSpec::required("to", FieldType::String)
                    .with_normalizer(Normalizer::EmailAddress)
                    .with_description("Recipient email address"),
            )
            .field(FieldSpec::required("subject", FieldType::String))
            .field(FieldSpec::optional("body", FieldType::FreeText)),
        ToolSchema::new("email_read", "Read recent email").field(FieldSpec::optional(
            "filter",
            FieldType::Enum {
                options: vec!["unread".to_string(), "all".to_string()],
            },
        )),
        ToolSchema::new("weather", "Current weather or forecast")
            .field(
                FieldSpec::required("location", FieldType::String)
                    .with_preference_default("location")
                    .with_description("City or place"),
            )
            .field(FieldSpec::optional("day", FieldType::Date)),
        ToolSchema::new("web_search", "Search the web")
            .field(FieldSpec::required("query", FieldType::FreeText)),
        ToolSchema::new("app_launch", "Open a desktop application")
            .field(FieldSpec::required("app_name", FieldType::String)),
        ToolSchema::new("terminal", "Run a shell command on the user's machine").field(
            FieldSpec::required("command", FieldType::FreeText)
                .with_description("The shell command to run, e.g. \"git status\"")
                .with_confirmation(),
        ),
        ToolSchema::new("memory_lookup", "Recall something from earlier conversations")
            .field(FieldSpec::required("query", FieldType::FreeText)),
    ]
}
