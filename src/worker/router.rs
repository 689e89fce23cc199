//! Request classification.

use reqwest::Method;

use crate::http::{Request, RequestDestination, RequestMode};

/// Path extensions routed to the image cache (case-sensitive).
const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "gif", "webp", "svg"];

/// Which strategy handles a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Not intercepted
  Passthrough,
  /// Network-first
  Navigation,
  /// Cache-first with bounded eviction
  Image,
  /// Stale-while-revalidate
  StaticAsset,
}

/// Classify a request; the first matching rule wins.
pub fn classify(request: &Request) -> Route {
  if request.method != Method::GET {
    Route::Passthrough
  } else if request.mode == RequestMode::Navigate {
    Route::Navigation
  } else if request.destination == RequestDestination::Image
    || has_image_extension(request.url.path())
  {
    Route::Image
  } else {
    Route::StaticAsset
  }
}

fn has_image_extension(path: &str) -> bool {
  path
    .rsplit_once('.')
    .map(|(_, ext)| IMAGE_EXTENSIONS.contains(&ext))
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn get(path: &str) -> Request {
    Request::get(Url::parse("https://shop.test/").unwrap().join(path).unwrap())
  }

  #[test]
  fn test_non_get_is_passthrough() {
    for method in [Method::POST, Method::PUT, Method::DELETE, Method::HEAD] {
      let request = Request::navigate(get("./").url).with_method(method);
      assert_eq!(classify(&request), Route::Passthrough);
    }
  }

  #[test]
  fn test_navigation_wins_over_image_extension() {
    let request = Request::navigate(get("./banner.png").url);
    assert_eq!(classify(&request), Route::Navigation);
  }

  #[test]
  fn test_image_by_destination() {
    let request = Request::image(get("./api/avatar?id=3").url);
    assert_eq!(classify(&request), Route::Image);
  }

  #[test]
  fn test_image_by_extension() {
    for path in ["a.png", "b.jpg", "c.jpeg", "d.gif", "e.webp", "assets/icons/icon-192.svg"] {
      assert_eq!(classify(&get(path)), Route::Image, "{}", path);
    }
  }

  #[test]
  fn test_extension_match_is_case_sensitive() {
    assert_eq!(classify(&get("LOGO.PNG")), Route::StaticAsset);
    assert_eq!(classify(&get("photo.Jpg")), Route::StaticAsset);
  }

  #[test]
  fn test_extension_checks_path_not_query() {
    assert_eq!(classify(&get("script.js?v=logo.png")), Route::StaticAsset);
    assert_eq!(classify(&get("img.png?size=2")), Route::Image);
    assert_eq!(classify(&get("v1.png/data")), Route::StaticAsset);
  }

  #[test]
  fn test_everything_else_is_static() {
    for path in ["styles.css", "script.js", "manifest.json", "fonts/a.woff2"] {
      assert_eq!(classify(&get(path)), Route::StaticAsset, "{}", path);
    }
  }
}
