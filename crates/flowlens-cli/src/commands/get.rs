use flowlens_core::{ApiClient, ApiRequest};

use crate::cli::GetArgs;
use crate::error::CliError;

use super::CommandResult;

pub async fn run(args: &GetArgs, client: &ApiClient) -> Result<CommandResult, CliError> {
    let request = build_request(args);
    let result = client.request(request).await;

    let failures = usize::from(!result.is_success());
    Ok(CommandResult::new(serde_json::to_value(&result)?, failures))
}

fn build_request(args: &GetArgs) -> ApiRequest {
    let request = args
        .params
        .iter()
        .fold(ApiRequest::get(args.endpoint.as_str()), |request, (name, value)| {
            request.with_param(name.as_str(), value)
        });
    if args.bypass_cache {
        request.bypass_cache()
    } else {
        request
    }
}

#[cfg(test)]
mod tests {
    use flowlens_core::CacheMode;

    use super::*;

    #[test]
    fn params_and_bypass_flag_reach_the_request() {
        let args = GetArgs {
            endpoint: String::from("/api/stock/AAPL/options-flow"),
            params: vec![(String::from("limit"), String::from("20"))],
            bypass_cache: true,
        };

        let request = build_request(&args);

        assert_eq!(request.cache_key(), "/api/stock/AAPL/options-flow|limit=20");
        assert_eq!(request.cache_mode, CacheMode::Bypass);
    }
}
