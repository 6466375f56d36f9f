mod common;

use anyhow::Context as _;
use serde_json::{Value, json};
use tempfile::tempdir;

use common::{BIN, McpStreamableHttpSession, start_items_api, start_server, tool_call_json, write_config};

#[tokio::test]
async fn tools_are_listed_and_called_over_streamable_http() -> anyhow::Result<()> {
    let (api, hits) = start_items_api().await?;
    let dir = tempdir()?;
    let cfg = write_config(
        &dir,
        &format!("name: items\nspec: {api}/openapi.json\nbase_url: {api}\n"),
    )?;
    let server = start_server(BIN, &cfg).await?;
    let session = McpStreamableHttpSession::connect(&server.base_url, None).await?;

    let tools_msg = session.request(1, "tools/list", json!({})).await?;
    let tools = tools_msg
        .pointer("/result/tools")
        .and_then(Value::as_array)
        .context("tools/list missing result.tools")?;
    let names: Vec<&str> = tools
        .iter()
        .filter_map(|t| t.get("name").and_then(Value::as_str))
        .collect();
    assert_eq!(names, vec!["list_items", "create_item", "get_item"]);
    let create = tools
        .iter()
        .find(|t| t["name"] == "create_item")
        .context("create_item missing")?;
    assert_eq!(create["inputSchema"]["required"], json!(["name"]));

    let got = session
        .request(2, "tools/call", json!({"name": "get_item", "arguments": {"item_id": 7}}))
        .await?;
    assert_eq!(tool_call_json(&got)?, json!({"id": 7, "name": "Lamp"}));
    assert_eq!(got["result"]["structuredContent"]["name"], "Lamp");

    let missing = session
        .request(3, "tools/call", json!({"name": "get_item", "arguments": {"item_id": 404}}))
        .await?;
    assert_eq!(missing["result"]["isError"], true);
    let text = missing
        .pointer("/result/content/0/text")
        .and_then(Value::as_str)
        .unwrap_or_default();
    assert!(text.starts_with("Error calling get_item. Status code: 404."), "{text}");
    assert_eq!(hits.count(), 2);
    Ok(())
}

#[tokio::test]
async fn invalid_arguments_never_reach_the_api() -> anyhow::Result<()> {
    let (api, hits) = start_items_api().await?;
    let dir = tempdir()?;
    let cfg = write_config(&dir, &format!("spec: {api}/openapi.json\nbase_url: {api}\n"))?;
    let server = start_server(BIN, &cfg).await?;
    let session = McpStreamableHttpSession::connect(&server.base_url, None).await?;

    let msg = session
        .request(1, "tools/call", json!({"name": "create_item", "arguments": {"age": 3}}))
        .await?;
    assert_eq!(msg["result"]["isError"], true);
    assert_eq!(msg["result"]["structuredContent"]["kind"], "invalid_arguments");
    assert_eq!(hits.count(), 0);

    let msg = session
        .request(2, "tools/call", json!({"name": "delete_everything", "arguments": {}}))
        .await?;
    assert_eq!(msg["result"]["structuredContent"]["kind"], "tool_not_found");

    let created = session
        .request(
            3,
            "tools/call",
            json!({"name": "create_item", "arguments": {"name": "Lamp", "age": 3}}),
        )
        .await?;
    assert_eq!(
        tool_call_json(&created)?["received"],
        json!({"name": "Lamp", "age": 3})
    );
    assert_eq!(hits.count(), 1);
    Ok(())
}

#[tokio::test]
async fn prompts_follow_filters_and_explicit_overrides() -> anyhow::Result<()> {
    let (api, _hits) = start_items_api().await?;
    let dir = tempdir()?;
    let cfg = write_config(
        &dir,
        &format!(
            r#"spec: {api}/openapi.json
base_url: {api}
include_operations: [get_item]
include_tags: []
prompts:
  - name: use_get_item
    description: Look an item up
    arguments:
      - name: item
        required: true
    template: "Find {{{{ item }}}} with get_item."
"#
        ),
    )?;
    let server = start_server(BIN, &cfg).await?;
    let session = McpStreamableHttpSession::connect(&server.base_url, None).await?;

    let list = session.request(1, "prompts/list", json!({})).await?;
    let prompts = list
        .pointer("/result/prompts")
        .and_then(Value::as_array)
        .context("prompts/list missing result.prompts")?;
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0]["description"], "Look an item up");

    let rendered = session
        .request(
            2,
            "prompts/get",
            json!({"name": "use_get_item", "arguments": {"item": "the lamp"}}),
        )
        .await?;
    assert_eq!(
        rendered.pointer("/result/messages/0/content/text"),
        Some(&json!("Find the lamp with get_item."))
    );

    let missing = session
        .request(3, "prompts/get", json!({"name": "use_list_items"}))
        .await?;
    assert_eq!(
        missing.pointer("/error/message"),
        Some(&json!("Prompt 'use_list_items' not found"))
    );
    Ok(())
}
